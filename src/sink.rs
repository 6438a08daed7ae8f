//! 변경 이벤트 출력

use crate::error::Result;
use crate::events::{ChangeEvent, Row};
use std::io::Write;

/// 변경 이벤트를 받는 쪽
pub trait EventSink {
    fn emit(&mut self, event: &ChangeEvent) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 콘솔 출력 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// 사람이 읽기 쉬운 여러 줄 형식
    #[default]
    Text,
    /// 이벤트당 JSON 한 줄
    Json,
}

/// `Write` 대상에 이벤트를 출력하는 sink
pub struct ConsoleSink<W: Write> {
    writer: W,
    format: OutputFormat,
    emitted: u64,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout(format: OutputFormat) -> Self {
        ConsoleSink::new(std::io::stdout(), format)
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        ConsoleSink {
            writer,
            format,
            emitted: 0,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_text(&mut self, event: &ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::Insert { table, row } => {
                writeln!(self.writer, "Insert into {}:", table)?;
                writeln!(self.writer, "{}", render_row(row)?)?;
            }
            ChangeEvent::Update {
                table,
                before,
                after,
            } => {
                writeln!(self.writer, "Update in {}:", table)?;
                writeln!(self.writer, "Before: {}", render_row(before)?)?;
                writeln!(self.writer, "After: {}", render_row(after)?)?;
            }
            ChangeEvent::Delete { table, row } => {
                writeln!(self.writer, "Delete from {}:", table)?;
                writeln!(self.writer, "{}", render_row(row)?)?;
            }
        }
        writeln!(self.writer, "---")?;
        Ok(())
    }
}

fn render_row(row: &Row) -> Result<String> {
    Ok(serde_json::to_string(row)?)
}

impl<W: Write> EventSink for ConsoleSink<W> {
    fn emit(&mut self, event: &ChangeEvent) -> Result<()> {
        match self.format {
            OutputFormat::Text => self.write_text(event)?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.writer, event)?;
                writeln!(self.writer)?;
            }
        }
        self.emitted += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CellValue;
    use crate::testing::row;

    fn john() -> Row {
        row(&[
            ("id", CellValue::Int(4)),
            ("name", "John".into()),
            ("email", "john@example.com".into()),
        ])
    }

    fn output(format: OutputFormat, events: &[ChangeEvent]) -> String {
        let mut sink = ConsoleSink::new(Vec::new(), format);
        for event in events {
            sink.emit(event).unwrap();
        }
        assert_eq!(sink.emitted(), events.len() as u64);
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn test_text_insert() {
        let text = output(
            OutputFormat::Text,
            &[ChangeEvent::Insert {
                table: "d.users".to_string(),
                row: john(),
            }],
        );
        assert_eq!(
            text,
            "Insert into d.users:\n{\"id\":4,\"name\":\"John\",\"email\":\"john@example.com\"}\n---\n"
        );
    }

    #[test]
    fn test_text_update_and_delete() {
        let mut after = john();
        after.insert("name".to_string(), "Johnny".into());

        let text = output(
            OutputFormat::Text,
            &[
                ChangeEvent::Update {
                    table: "d.users".to_string(),
                    before: john(),
                    after,
                },
                ChangeEvent::Delete {
                    table: "d.users".to_string(),
                    row: john(),
                },
            ],
        );
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Update in d.users:");
        assert!(lines[1].starts_with("Before: ") && lines[1].contains("\"John\""));
        assert!(lines[2].starts_with("After: ") && lines[2].contains("\"Johnny\""));
        assert_eq!(lines[3], "---");
        assert_eq!(lines[4], "Delete from d.users:");
        assert_eq!(lines[6], "---");
    }

    #[test]
    fn test_json_lines() {
        let text = output(
            OutputFormat::Json,
            &[
                ChangeEvent::Insert {
                    table: "d.users".to_string(),
                    row: john(),
                },
                ChangeEvent::Delete {
                    table: "d.users".to_string(),
                    row: row(&[("id", CellValue::Int(4)), ("note", CellValue::Null)]),
                },
            ],
        );
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "insert");
        assert_eq!(lines[0]["table"], "d.users");
        assert_eq!(lines[0]["row"]["email"], "john@example.com");
        assert_eq!(lines[1]["type"], "delete");
        assert!(lines[1]["row"]["note"].is_null());
    }
}
