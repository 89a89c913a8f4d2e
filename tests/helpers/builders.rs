use serde_json::{json, Value};
use std::io::Write;
use tempfile::NamedTempFile;
use tributary::normalizer::RawRow;

/// A `{name, email, company}` input row.
pub fn row(name: &str, email: &str, company: &str) -> RawRow {
    as_row(json!({ "name": name, "email": email, "company": company }))
}

pub fn as_row(value: Value) -> RawRow {
    value
        .as_object()
        .cloned()
        .expect("row must be a JSON object")
}

/// Builder for CSV files on disk
pub struct CsvFileBuilder {
    header: String,
    lines: Vec<String>,
}

impl CsvFileBuilder {
    pub fn new() -> Self {
        Self {
            header: "name,email,company".to_string(),
            lines: Vec::new(),
        }
    }

    pub fn with_header(mut self, header: &str) -> Self {
        self.header = header.to_string();
        self
    }

    pub fn line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    /// `count` distinct, valid people
    pub fn people(mut self, count: usize) -> Self {
        let start = self.lines.len();
        for i in start..start + count {
            self.lines
                .push(format!("Person {i},person{i}@example.com,Company {}", i % 17));
        }
        self
    }

    pub fn build(self) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        writeln!(file, "{}", self.header).expect("Failed to write header");
        for line in &self.lines {
            writeln!(file, "{}", line).expect("Failed to write line");
        }
        file.flush().expect("Failed to flush csv");
        file
    }
}
