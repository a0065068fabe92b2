//! Minimal RFC 4180 writer: CRLF line ends, fields quoted only when needed.

#[derive(Default)]
pub struct CsvWriter {
    out: String,
}

impl CsvWriter {
    pub fn with_header(header: &[&str]) -> Self {
        let mut writer = Self::default();
        writer.row(header);
        writer
    }

    pub fn row(&mut self, fields: &[&str]) {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.out.push(',');
            }
            push_field(&mut self.out, field);
        }
        self.out.push_str("\r\n");
    }

    pub fn finish(self) -> String {
        self.out
    }
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
    } else {
        out.push_str(field);
    }
}

/// Shortest decimal form, so `50.0` is written as `50`.
pub fn number(value: f64) -> String {
    value.to_string()
}
