pub mod any_dataset;
pub mod mitocheck;
