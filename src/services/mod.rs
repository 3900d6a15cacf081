pub mod aggregation;
pub mod classifier;
pub mod crypto;
pub mod import;
pub mod openai;
pub mod processor;
pub mod spreadsheet;
pub mod state;
pub mod text_extraction;
