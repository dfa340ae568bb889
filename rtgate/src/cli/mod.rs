mod args;

pub use args::{parse_keywords, parse_level, Args};
