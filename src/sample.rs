use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Text(String),
}

/// One validated reading. Built once by a driver and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    device_id: String,
    timestamp: DateTime<Utc>,
    fields: Vec<(String, FieldValue)>,
}

impl Sample {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            fields: Vec::new(),
        }
    }

    pub fn with_float(mut self, name: &str, value: f64) -> Self {
        self.fields.push((name.to_string(), FieldValue::Float(value)));
        self
    }

    pub fn with_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields
            .push((name.to_string(), FieldValue::Text(value.into())));
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// Prefix every buffered record starts with. The tailer scans for it when recovering a
/// record boundary.
pub fn record_marker(measurement: &str) -> String {
    format!("{},id=", escape_measurement(measurement))
}

/// Encodes one sample as a line-protocol record (no trailing newline).
///
/// Non-finite floats are dropped; `None` is returned when nothing encodable is left or the
/// timestamp is outside the nanosecond range.
pub fn encode_line(measurement: &str, sample: &Sample) -> Option<String> {
    let timestamp_ns = sample.timestamp.timestamp_nanos_opt()?;

    let mut fields = Vec::with_capacity(sample.fields.len());
    for (name, value) in &sample.fields {
        let encoded = match value {
            FieldValue::Float(v) if v.is_finite() => format!("{v}"),
            FieldValue::Float(_) => continue,
            FieldValue::Text(text) => format!("\"{}\"", escape_string_field(text)),
        };
        fields.push(format!("{}={}", escape_key(name), encoded));
    }
    if fields.is_empty() {
        return None;
    }

    Some(format!(
        "{}{} {} {}",
        record_marker(measurement),
        escape_key(&sample.device_id),
        fields.join(","),
        timestamp_ns
    ))
}

fn escape_measurement(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == ',' || ch == ' ' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn escape_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == ',' || ch == '=' || ch == ' ' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Records are newline-delimited on disk, so line breaks inside text become `\n` / `\r`.
fn escape_string_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '"' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn encodes_floats_and_strings_in_field_order() {
        let sample = Sample::new("140344", at(1_700_000_000))
            .with_float("value", 14.6959)
            .with_text("baro_time", "2023-11-14T22:13:20.000000");

        let line = encode_line("paros1", &sample).unwrap();
        assert_eq!(
            line,
            "paros1,id=140344 value=14.6959,baro_time=\"2023-11-14T22:13:20.000000\" 1700000000000000000"
        );
        assert!(line.starts_with(&record_marker("paros1")));
    }

    #[test]
    fn escapes_separators() {
        let sample = Sample::new("dev 1", at(10))
            .with_float("a,b", 1.0)
            .with_text("note", "say \"hi\"");
        let line = encode_line("box one", &sample).unwrap();
        assert_eq!(
            line,
            "box\\ one,id=dev\\ 1 a\\,b=1,note=\"say \\\"hi\\\"\" 10000000000"
        );
    }

    #[test]
    fn text_fields_never_contain_line_breaks() {
        let sample = Sample::new("imu", at(10)).with_text("note", "first\r\nsecond");
        let line = encode_line("box", &sample).unwrap();
        assert!(!line.contains('\n') && !line.contains('\r'), "{line}");
        assert_eq!(line, "box,id=imu note=\"first\\r\\nsecond\" 10000000000");
    }

    #[test]
    fn drops_non_finite_fields_and_empty_samples() {
        let sample = Sample::new("imu", at(10))
            .with_float("accelX", f64::NAN)
            .with_float("accelY", 0.5);
        let line = encode_line("box", &sample).unwrap();
        assert_eq!(line, "box,id=imu accelY=0.5 10000000000");

        let empty = Sample::new("imu", at(10)).with_float("accelX", f64::INFINITY);
        assert!(encode_line("box", &empty).is_none());
    }
}
