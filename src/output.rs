use std::io::Write;
use std::path::PathBuf;

use csv_core::WriteResult;

use crate::catalog::Catalog;
use crate::snapshot::Snapshot;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Csv)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("CSV writer ran out of buffer space")]
    SerializeCsv,
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<dyn Write>,
        };
        Ok(Output::new(io, self.output, self.format))
    }
}

pub struct Output<W = Box<dyn Write>> {
    destination: Option<PathBuf>,
    io: W,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl<W: Write> Output<W> {
    /// `destination` is only used to report errors.
    pub fn new(io: W, destination: Option<PathBuf>, format: Format) -> Self {
        let formatter = match format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Self { destination, io, formatter }
    }

    /// Must be called before any of the results are written.
    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                debug_assert!(!*written_records, "CSV headers must be written first");
                *written_records = true;
                self.write_csv_row(&hdrs)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(hdrs);
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(
        &mut self,
        values: &[V],
    ) -> Result<(), Error> {
        // Worst case every byte is a quote that needs escaping, plus the surrounding quotes.
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::WriterBuilder::new().delimiter(b';').build();
        let mut row = Vec::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    return Err(Error::SerializeCsv);
                };
                row.extend_from_slice(&output[..ob]);
            }
            let (WriteResult::InputEmpty, _, ob) = writer.field(value.as_bytes(), &mut output)
            else {
                return Err(Error::SerializeCsv);
            };
            row.extend_from_slice(&output[..ob]);
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            return Err(Error::SerializeCsv);
        };
        row.extend_from_slice(&output[..ob]);
        self.io.write_all(&row).map_err(|e| self.write_error(e))
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.destination {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<W, Error> {
        if let Formatter::Table { comfy } = &self.formatter {
            writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))?;
        Ok(self.io)
    }
}

/// Human readable listing of a snapshot, one setpoint per line.
///
/// Setpoints are listed in name order, with a blank line whenever the first letter of the name
/// changes.
pub fn write_dump(
    w: &mut dyn Write,
    device: &str,
    catalog: &Catalog,
    snapshot: &Snapshot,
) -> std::io::Result<()> {
    writeln!(w, "{device} Information:")?;
    if let Some(clock) = &snapshot.clock {
        writeln!(w, "  Date/Time Reported:  {clock}")?;
    }
    writeln!(w, "  Setpoints:")?;
    let mut group = None;
    for (name, spec) in catalog.iter() {
        let Some(value) = snapshot.values.get(name) else {
            continue;
        };
        let first = name.chars().next();
        if group.is_some() && group != first {
            writeln!(w)?;
        }
        group = first;
        let description = spec.description.as_deref().unwrap_or("");
        let unit = spec.unit.as_deref().unwrap_or("");
        let line = format!("    {name: >3}  {description: <30}  {value} {unit}");
        writeln!(w, "{}", line.trim_end())?;
    }
    Ok(())
}
