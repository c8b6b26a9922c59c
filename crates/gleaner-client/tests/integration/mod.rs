mod common;
mod extraction_tests;
mod job_tests;
