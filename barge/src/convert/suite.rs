use std::collections::HashMap;

use crate::convert::{BytesStyle, ColumnConverter};

/// Wire type names the exporter tags columns with.
const TYPE_BYTES: &str = "BYTES";
const TYPE_BOOLEAN: &str = "BOOLEAN";
const TYPE_DATE: &str = "io.debezium.time.Date";
const TYPE_TIMESTAMP: &str = "io.debezium.time.Timestamp";
const TYPE_MICRO_TIMESTAMP: &str = "io.debezium.time.MicroTimestamp";
const TYPE_MICRO_TIME: &str = "io.debezium.time.MicroTime";

/// Converter suite for the YugabyteDB target.
///
/// Untagged types pass through; the exporter's representation is already
/// valid COPY input, and event statements embed it as a quoted literal the
/// server coerces the same way.
pub fn yugabyte_converter_suite() -> HashMap<String, ColumnConverter> {
    HashMap::from([
        (
            TYPE_BYTES.to_string(),
            ColumnConverter::Bytes {
                style: BytesStyle::ByteaHex,
            },
        ),
        (
            TYPE_BOOLEAN.to_string(),
            ColumnConverter::Boolean { as_digit: false },
        ),
        (
            TYPE_DATE.to_string(),
            ColumnConverter::EpochDays {
                ansi_literal: false,
            },
        ),
        (
            TYPE_TIMESTAMP.to_string(),
            ColumnConverter::EpochMillis {
                ansi_literal: false,
            },
        ),
        (
            TYPE_MICRO_TIMESTAMP.to_string(),
            ColumnConverter::EpochMicros {
                ansi_literal: false,
            },
        ),
        (TYPE_MICRO_TIME.to_string(), ColumnConverter::MicrosOfDay),
    ])
}

/// Converter suite for the Oracle target.
///
/// Everything that reaches Oracle is embedded as a literal, so temporal types
/// use ANSI `DATE`/`TIMESTAMP` literals and booleans become digits.
pub fn oracle_converter_suite() -> HashMap<String, ColumnConverter> {
    HashMap::from([
        (
            TYPE_BYTES.to_string(),
            ColumnConverter::Bytes {
                style: BytesStyle::HexToRaw,
            },
        ),
        (
            TYPE_BOOLEAN.to_string(),
            ColumnConverter::Boolean { as_digit: true },
        ),
        (
            TYPE_DATE.to_string(),
            ColumnConverter::EpochDays { ansi_literal: true },
        ),
        (
            TYPE_TIMESTAMP.to_string(),
            ColumnConverter::EpochMillis { ansi_literal: true },
        ),
        (
            TYPE_MICRO_TIMESTAMP.to_string(),
            ColumnConverter::EpochMicros { ansi_literal: true },
        ),
        (TYPE_MICRO_TIME.to_string(), ColumnConverter::MicrosOfDay),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suites_cover_the_same_type_names() {
        let yb = yugabyte_converter_suite();
        let ora = oracle_converter_suite();

        let mut yb_keys: Vec<_> = yb.keys().collect();
        let mut ora_keys: Vec<_> = ora.keys().collect();
        yb_keys.sort();
        ora_keys.sort();

        assert_eq!(yb_keys, ora_keys);
    }
}
