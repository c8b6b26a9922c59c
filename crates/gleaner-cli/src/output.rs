//! Record serialisation for stdout or a file.

use std::collections::BTreeSet;
use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use gleaner_core::ExtractedRecord;

/// Multiple values and image lists share one CSV cell.
const CELL_SEPARATOR: &str = "; ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

pub fn write_records<W: Write>(
    records: &[ExtractedRecord],
    format: OutputFormat,
    mut writer: W,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, records)?;
            writeln!(writer)?;
            writer.flush()?;
        }
        OutputFormat::Csv => write_csv(records, writer)?,
    }
    Ok(())
}

/// One row per record; columns are the union of field names in sorted order.
fn write_csv<W: Write>(records: &[ExtractedRecord], writer: W) -> Result<()> {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();
    let with_images = records.iter().any(|r| !r.images.is_empty());

    let mut out = csv::Writer::from_writer(writer);
    let mut header = vec!["url", "itemIndex"];
    header.extend(columns.iter().copied());
    if with_images {
        header.push("images");
    }
    out.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.url.clone(),
            record.item_index.map(|i| i.to_string()).unwrap_or_default(),
        ];
        for column in &columns {
            row.push(
                record
                    .fields
                    .get(*column)
                    .map(|v| v.join(CELL_SEPARATOR))
                    .unwrap_or_default(),
            );
        }
        if with_images {
            row.push(record.images.join(CELL_SEPARATOR));
        }
        out.write_record(&row)?;
    }
    out.flush()?;
    Ok(())
}
