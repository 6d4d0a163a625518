/// Newline delimited text.
pub(crate) mod lines;
