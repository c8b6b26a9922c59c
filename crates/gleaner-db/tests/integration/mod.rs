mod common;
mod history_tests;
