pub mod batches;
pub mod core;
pub mod grade_sheets;
pub mod grading_config;
