use crate::time::TICKS_PER_SECOND;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Column value types supported by [`StructuredLogFile`]. `Enum` columns
/// hold a `u32` that is rendered through the supplied name table.
#[derive(Debug, Copy, Clone)]
pub enum ColumnType {
    UInt32,
    UInt64,
    Float,
    Enum(&'static [&'static str]),
}

impl ColumnType {
    fn name(&self) -> &'static str {
        match self {
            ColumnType::UInt32 => "UInt32",
            ColumnType::UInt64 => "UInt64",
            ColumnType::Float => "Float",
            ColumnType::Enum(_) => "Enum",
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnType,
}

#[derive(Debug, Copy, Clone)]
enum Cell {
    Empty,
    U32(u32),
    U64(u64),
    F32(f32),
}

/// A CSV log with a typed header row. Columns are declared at open time;
/// each line is filled in column-wise and emitted with `flush_line`.
pub struct StructuredLogFile {
    out: Option<BufWriter<File>>,
    columns: Vec<Column>,
    line: Vec<Cell>,
}

impl StructuredLogFile {
    #[inline]
    pub fn new() -> StructuredLogFile {
        StructuredLogFile {
            out: None,
            columns: Vec::new(),
            line: Vec::new(),
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.out.is_some()
    }

    /// Opens the file and writes the header row (`Name (Type)` per column).
    pub fn open<P: AsRef<Path>>(&mut self, path: P, columns: &[Column]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);

        let header: Vec<String> = columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.kind.name()))
            .collect();
        writeln!(out, "{}", header.join(","))?;

        self.columns = columns.to_vec();
        self.line = vec![Cell::Empty; columns.len()];
        self.out = Some(out);

        Ok(())
    }

    #[inline]
    pub fn set_u32(&mut self, start_column: usize, values: &[u32]) {
        for (i, v) in values.iter().enumerate() {
            self.line[start_column + i] = Cell::U32(*v);
        }
    }

    #[inline]
    pub fn set_u64(&mut self, start_column: usize, values: &[u64]) {
        for (i, v) in values.iter().enumerate() {
            self.line[start_column + i] = Cell::U64(*v);
        }
    }

    #[inline]
    pub fn set_f32(&mut self, start_column: usize, values: &[f32]) {
        for (i, v) in values.iter().enumerate() {
            self.line[start_column + i] = Cell::F32(*v);
        }
    }

    /// Writes the current line and clears the cells. Cells never set render
    /// as empty fields.
    pub fn flush_line(&mut self) -> io::Result<()> {
        let out = match self.out.as_mut() {
            Some(out) => out,
            None => return Ok(()),
        };

        let mut fields = Vec::with_capacity(self.columns.len());
        for (cell, column) in self.line.iter().zip(self.columns.iter()) {
            let rendered = match (cell, column.kind) {
                (Cell::U32(v), ColumnType::Enum(names)) => match names.get(*v as usize) {
                    Some(name) => (*name).to_string(),
                    None => v.to_string(),
                },
                (Cell::U32(v), _) => v.to_string(),
                (Cell::U64(v), _) => v.to_string(),
                (Cell::F32(v), _) => format!("{:.6}", v),
                (Cell::Empty, _) => String::new(),
            };
            fields.push(rendered);
        }

        writeln!(out, "{}", fields.join(","))?;

        for cell in self.line.iter_mut() {
            *cell = Cell::Empty;
        }

        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        self.columns.clear();
        self.line.clear();
        Ok(())
    }
}

/// A plain-text log where every line is prefixed with the elapsed seconds
/// and the raw tick count: `"   1.500 [1500000000]: message"`.
pub struct TimestampedLogFile {
    out: Option<BufWriter<File>>,
    start_ticks: i64,
}

impl TimestampedLogFile {
    #[inline]
    pub fn new() -> TimestampedLogFile {
        TimestampedLogFile {
            out: None,
            start_ticks: 0,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.out.is_some()
    }

    pub fn open<P: AsRef<Path>>(&mut self, path: P, start_ticks: i64) -> io::Result<()> {
        self.out = Some(BufWriter::new(File::create(path)?));
        self.start_ticks = start_ticks;
        Ok(())
    }

    pub fn write_line(&mut self, ticks: i64, message: &str) {
        let out = match self.out.as_mut() {
            Some(out) => out,
            None => return,
        };

        let seconds = (ticks - self.start_ticks) as f64 / TICKS_PER_SECOND as f64;
        // Write failures on a diagnostic log are not worth killing the tick.
        drop(writeln!(
            out,
            "{:8.3} [{:10}]: {}",
            seconds,
            ticks,
            message.trim_end_matches('\n')
        ));
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("quark-logfile-{}-{}", std::process::id(), name));
        path
    }

    const PACKET_NAMES: &[&str] = &["NoOp", "Acknowledge", "ReliableMessage"];

    #[test]
    fn test_structured_header_and_rows() {
        let path = temp_path("structured.csv");

        let columns = [
            Column {
                name: "SnapshotID",
                kind: ColumnType::UInt32,
            },
            Column {
                name: "Timestamp",
                kind: ColumnType::UInt64,
            },
            Column {
                name: "PacketType",
                kind: ColumnType::Enum(PACKET_NAMES),
            },
            Column {
                name: "Value",
                kind: ColumnType::Float,
            },
        ];

        let mut log = StructuredLogFile::new();
        assert!(!log.is_open());

        log.open(&path, &columns).unwrap();
        assert!(log.is_open());

        log.set_u32(0, &[7]);
        log.set_u64(1, &[123_456]);
        log.set_u32(2, &[1]);
        log.set_f32(3, &[2.5]);
        log.flush_line().unwrap();

        // A partially filled line leaves the unset cells empty.
        log.set_u32(0, &[8]);
        log.flush_line().unwrap();

        log.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(
            lines[0],
            "SnapshotID (UInt32),Timestamp (UInt64),PacketType (Enum),Value (Float)"
        );
        assert_eq!(lines[1], "7,123456,Acknowledge,2.500000");
        assert_eq!(lines[2], "8,,,");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_structured_closed_is_noop() {
        let mut log = StructuredLogFile::new();
        log.flush_line().unwrap();
        log.close().unwrap();
    }

    #[test]
    fn test_timestamped_format() {
        let path = temp_path("timestamped.txt");

        let mut log = TimestampedLogFile::new();
        log.open(&path, 0).unwrap();
        log.write_line(TICKS_PER_SECOND + TICKS_PER_SECOND / 2, "hello\n");
        log.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "   1.500 [1500000000]: hello\n");

        fs::remove_file(&path).unwrap();
    }
}
