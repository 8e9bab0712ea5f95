//! Conversion of exported wire values into target dialect literals.
//!
//! The CDC exporter serializes column values in a type-tagged wire form
//! (base64 for bytes, epoch offsets for temporal types). Each target dialect
//! accepts a different literal form, so the adapter supplies a suite of
//! per-type-name converters that is resolved once per column against the
//! schema manifest shipped in the export directory. Dispatch is a tagged
//! variant, not a string lookup in the hot path.

mod suite;

pub use suite::{oracle_converter_suite, yugabyte_converter_suite};

use std::collections::HashMap;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate};

use crate::descriptor::{DATA_DIR_NAME, DataFileDescriptor};
use crate::error::{BargeResult, ErrorKind};
use crate::types::Event;

/// Days between 0001-01-01 (day 1 of the common era) and the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// How byte columns are rendered for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytesStyle {
    /// Postgres `\x`-prefixed hex (`bytea` input form).
    ByteaHex,
    /// Oracle `HEXTORAW('...')` call; only meaningful formatted.
    HexToRaw,
}

/// Converter for one wire type, selected per column at startup.
///
/// `format_if_required` asks for a literal that can be embedded directly in a
/// SQL statement for the target dialect; without it the output is the bare
/// value in the form the target's bulk load accepts, and statement builders
/// quote it themselves where they embed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnConverter {
    /// Value passes through unchanged; formatting adds single quotes.
    Passthrough,
    /// `true`/`false` wire booleans; Oracle stores them as digits.
    Boolean { as_digit: bool },
    /// Base64 wire bytes.
    Bytes { style: BytesStyle },
    /// Days since the Unix epoch.
    EpochDays { ansi_literal: bool },
    /// Milliseconds since the Unix epoch.
    EpochMillis { ansi_literal: bool },
    /// Microseconds since the Unix epoch.
    EpochMicros { ansi_literal: bool },
    /// Microseconds since midnight.
    MicrosOfDay,
}

impl ColumnConverter {
    /// Converts one wire value.
    pub fn convert(&self, raw: &str, format_if_required: bool) -> BargeResult<String> {
        match self {
            ColumnConverter::Passthrough => Ok(if format_if_required {
                quote_literal(raw)
            } else {
                raw.to_string()
            }),
            ColumnConverter::Boolean { as_digit } => {
                let truthy = match raw {
                    "true" | "t" => true,
                    "false" | "f" => false,
                    other => {
                        return Err(crate::barge_error!(
                            ErrorKind::ConversionFailed,
                            "Invalid boolean wire value",
                            other
                        ));
                    }
                };

                Ok(match (as_digit, truthy) {
                    (true, true) => "1".to_string(),
                    (true, false) => "0".to_string(),
                    (false, true) => "true".to_string(),
                    (false, false) => "false".to_string(),
                })
            }
            ColumnConverter::Bytes { style } => {
                let bytes = BASE64.decode(raw).map_err(|err| {
                    crate::barge_error!(
                        ErrorKind::ConversionFailed,
                        "Invalid base64 in byte column"
                    )
                    .with_source(err)
                })?;
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

                Ok(match style {
                    BytesStyle::ByteaHex if format_if_required => format!("'\\x{hex}'"),
                    BytesStyle::ByteaHex => format!("\\x{hex}"),
                    BytesStyle::HexToRaw => format!("HEXTORAW('{hex}')"),
                })
            }
            ColumnConverter::EpochDays { ansi_literal } => {
                let days: i64 = parse_wire_int(raw)?;
                let date = NaiveDate::from_num_days_from_ce_opt(
                    i32::try_from(days + UNIX_EPOCH_DAYS_FROM_CE).map_err(|_| {
                        out_of_range_error(raw)
                    })?,
                )
                .ok_or_else(|| out_of_range_error(raw))?;

                Ok(temporal_literal(
                    date.format("%Y-%m-%d").to_string(),
                    format_if_required,
                    *ansi_literal,
                    "DATE",
                ))
            }
            ColumnConverter::EpochMillis { ansi_literal } => {
                let millis: i64 = parse_wire_int(raw)?;
                let ts = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| out_of_range_error(raw))?;

                Ok(temporal_literal(
                    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                    format_if_required,
                    *ansi_literal,
                    "TIMESTAMP",
                ))
            }
            ColumnConverter::EpochMicros { ansi_literal } => {
                let micros: i64 = parse_wire_int(raw)?;
                let ts = DateTime::from_timestamp_micros(micros)
                    .ok_or_else(|| out_of_range_error(raw))?;

                Ok(temporal_literal(
                    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                    format_if_required,
                    *ansi_literal,
                    "TIMESTAMP",
                ))
            }
            ColumnConverter::MicrosOfDay => {
                let micros: i64 = parse_wire_int(raw)?;
                let seconds = micros / 1_000_000;
                let rendered = format!(
                    "{:02}:{:02}:{:02}.{:06}",
                    seconds / 3600,
                    (seconds / 60) % 60,
                    seconds % 60,
                    micros % 1_000_000
                );

                Ok(if format_if_required {
                    quote_literal(&rendered)
                } else {
                    rendered
                })
            }
        }
    }
}

fn parse_wire_int(raw: &str) -> BargeResult<i64> {
    raw.parse::<i64>().map_err(|err| {
        crate::barge_error!(
            ErrorKind::ConversionFailed,
            "Invalid integer wire value",
            raw
        )
        .with_source(err)
    })
}

fn out_of_range_error(raw: &str) -> crate::error::BargeError {
    crate::barge_error!(
        ErrorKind::ConversionFailed,
        "Temporal wire value out of range",
        raw
    )
}

fn temporal_literal(
    rendered: String,
    format_if_required: bool,
    ansi_literal: bool,
    keyword: &str,
) -> String {
    if !format_if_required {
        return rendered;
    }

    if ansi_literal {
        format!("{keyword} '{rendered}'")
    } else {
        quote_literal(&rendered)
    }
}

/// Quotes a string as a SQL literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Per-column transform from CDC wire representation to target dialect
/// literals.
///
/// Built once at startup from the adapter's converter suite and the schema
/// manifest shipped in the export directory; read-only afterwards, shared by
/// every worker.
#[derive(Debug)]
pub struct ValueConverter {
    /// Column type names per table, from the schema manifest. Tables absent
    /// here get passthrough conversion for every column.
    column_types: HashMap<String, HashMap<String, String>>,
    suite: HashMap<String, ColumnConverter>,
    delimiter: char,
    quote_char: Option<u8>,
    escape_char: Option<u8>,
    null_string: String,
}

impl ValueConverter {
    /// Loads the schema manifest (`data/schemas/columns.json`) and binds it to
    /// the target's converter suite. A missing manifest means the export
    /// carries no type-tagged columns and everything passes through.
    pub fn load(
        export_dir: &Path,
        descriptor: &DataFileDescriptor,
        suite: HashMap<String, ColumnConverter>,
    ) -> BargeResult<Self> {
        let manifest_path = export_dir
            .join(DATA_DIR_NAME)
            .join("schemas")
            .join("columns.json");

        let column_types = if manifest_path.exists() {
            let raw = std::fs::read_to_string(&manifest_path)?;
            serde_json::from_str(&raw).map_err(|err| {
                crate::barge_error!(
                    ErrorKind::SchemaManifestInvalid,
                    "Schema manifest is not valid JSON",
                    manifest_path.display()
                )
                .with_source(err)
            })?
        } else {
            HashMap::new()
        };

        Ok(Self {
            column_types,
            suite,
            delimiter: descriptor.delimiter,
            quote_char: descriptor.quote_char,
            escape_char: descriptor.escape_char,
            null_string: descriptor.null_string.clone(),
        })
    }

    fn converter_for(&self, table: &str, column: &str) -> ColumnConverter {
        self.column_types
            .get(table)
            .and_then(|columns| columns.get(column))
            .and_then(|type_name| self.suite.get(type_name))
            .copied()
            .unwrap_or(ColumnConverter::Passthrough)
    }

    /// Converts one data file line during snapshot splitting.
    ///
    /// Fields equal to the null string pass through untouched. Quoted fields
    /// keep their quoting when the column passes through; converted columns
    /// (bytes, temporal) never need quoting in the output.
    pub fn convert_row(
        &self,
        table: &str,
        columns: &[String],
        line: &str,
    ) -> BargeResult<String> {
        if !self.column_types.contains_key(table) {
            return Ok(line.to_string());
        }

        let fields = split_fields(line, self.delimiter, self.quote_char, self.escape_char);
        let mut converted = Vec::with_capacity(fields.len());

        for (i, field) in fields.iter().enumerate() {
            let Some(column) = columns.get(i) else {
                converted.push(field.clone());
                continue;
            };

            if *field == self.null_string {
                converted.push(field.clone());
                continue;
            }

            match self.converter_for(table, column) {
                ColumnConverter::Passthrough => converted.push(field.clone()),
                converter => {
                    let bare = strip_quotes(field, self.quote_char);
                    converted.push(converter.convert(bare, false)?);
                }
            }
        }

        Ok(converted.join(&self.delimiter.to_string()))
    }

    /// Converts every value of one change event in place.
    ///
    /// `format_if_required` is true iff the target is YugabyteDB and the op is
    /// an update, or the target is Oracle; those paths embed the values as
    /// dialect literals instead of binding them.
    pub fn convert_event(
        &self,
        event: &mut Event,
        table: &str,
        format_if_required: bool,
    ) -> BargeResult<()> {
        for map in [&mut event.key, &mut event.fields] {
            for (column, value) in map.iter_mut() {
                if let Some(raw) = value {
                    let converter = self
                        .column_types
                        .get(table)
                        .and_then(|columns| columns.get(column))
                        .and_then(|type_name| self.suite.get(type_name))
                        .copied()
                        .unwrap_or(ColumnConverter::Passthrough);

                    *raw = converter.convert(raw, format_if_required)?;
                }
            }
        }

        Ok(())
    }
}

/// Splits one record into fields on the delimiter, honoring quoting and
/// escaping. Fields keep their original quoting.
fn split_fields(
    line: &str,
    delimiter: char,
    quote_char: Option<u8>,
    escape_char: Option<u8>,
) -> Vec<String> {
    let quote = quote_char.map(char::from);
    let escape = escape_char.map(char::from);

    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(esc) = escape {
            // Backslash style escaping hides the next character; doubled-quote
            // style is handled by quote parity below.
            if c == esc && Some(esc) != quote && chars.peek().is_some() {
                current.push(c);
                current.push(chars.next().unwrap_or_default());
                continue;
            }
        }

        if Some(c) == quote {
            in_quotes = !in_quotes;
            current.push(c);
            continue;
        }

        if c == delimiter && !in_quotes {
            fields.push(std::mem::take(&mut current));
            continue;
        }

        current.push(c);
    }

    fields.push(current);
    fields
}

fn strip_quotes(field: &str, quote_char: Option<u8>) -> &str {
    let Some(quote) = quote_char.map(char::from) else {
        return field;
    };

    field
        .strip_prefix(quote)
        .and_then(|s| s.strip_suffix(quote))
        .unwrap_or(field)
}
