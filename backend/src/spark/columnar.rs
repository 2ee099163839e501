//! Compact row/column representation of records sharing field names.
//!
//! A columnar value is a JSON array of at least two arrays: a header of unique
//! strings followed by rows of the same width.
//!
//! ```text
//! [["a", "b"], [1, 2], [3, 4]]  ->  [{"a": 1, "b": 2}, {"a": 3, "b": 4}]
//! [["a"], [1]]                  ->  {"a": 1}
//! ```
//!
//! Exactly one data row expands to a single object, more rows to an array of
//! objects, so `serialize(deserialize(x)) == x` for every columnar `x`.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Columnar,
    Json,
}

pub fn is_columnar(value: &Value) -> bool {
    let Value::Array(rows) = value else {
        return false;
    };
    if rows.len() < 2 {
        return false;
    }

    let Some(header) = header_of(&rows[0]) else {
        return false;
    };

    rows[1..]
        .iter()
        .all(|row| matches!(row, Value::Array(cells) if cells.len() == header.len()))
}

/// Expands a columnar value into records; `None` if `value` is not columnar.
pub fn deserialize(value: &Value) -> Option<Value> {
    if !is_columnar(value) {
        return None;
    }
    let rows = value.as_array()?;
    let header = header_of(&rows[0])?;

    let mut records: Vec<Value> = rows[1..]
        .iter()
        .filter_map(Value::as_array)
        .map(|cells| {
            let record: Map<String, Value> = header
                .iter()
                .map(|k| k.to_string())
                .zip(cells.iter().cloned())
                .collect();
            Value::Object(record)
        })
        .collect();

    if records.len() == 1 {
        records.pop()
    } else {
        Some(Value::Array(records))
    }
}

/// Compacts one record or a list of records into columnar form.
///
/// The header comes from the first record; fields absent from later records
/// become `null`. Returns `None` for anything that is not a non-empty object or
/// a non-empty list of objects.
pub fn serialize(value: &Value) -> Option<Value> {
    let records: Vec<&Map<String, Value>> = match value {
        Value::Object(map) => vec![map],
        Value::Array(items) if !items.is_empty() => {
            items.iter().map(Value::as_object).collect::<Option<Vec<_>>>()?
        }
        _ => return None,
    };

    let header: Vec<String> = records.first()?.keys().cloned().collect();
    if header.is_empty() {
        return None;
    }

    let mut rows = Vec::with_capacity(records.len() + 1);
    rows.push(Value::Array(
        header.iter().cloned().map(Value::String).collect(),
    ));
    for record in records {
        rows.push(Value::Array(
            header
                .iter()
                .map(|k| record.get(k).cloned().unwrap_or(Value::Null))
                .collect(),
        ));
    }

    Some(Value::Array(rows))
}

/// Detects the format of `inputs` and expands columnar data.
///
/// `shared` is expanded only when the inputs are columnar and `shared` itself
/// is columnar; otherwise it passes through untouched.
pub fn infer_format(inputs: Value, shared: Option<Value>) -> (Format, Value, Option<Value>) {
    match deserialize(&inputs) {
        Some(data) => {
            let shared = shared.map(|s| deserialize(&s).unwrap_or(s));
            (Format::Columnar, data, shared)
        }
        None => (Format::Json, inputs, shared),
    }
}

fn header_of(row: &Value) -> Option<Vec<&str>> {
    let cells = row.as_array()?;
    if cells.is_empty() {
        return None;
    }

    let names: Vec<&str> = cells.iter().map(Value::as_str).collect::<Option<_>>()?;
    let unique: HashSet<&str> = names.iter().copied().collect();
    (unique.len() == names.len()).then_some(names)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn cell() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-z0-9 ]{0,8}".prop_map(Value::from),
            Just(Value::Null),
        ]
    }

    fn columnar() -> impl Strategy<Value = Value> {
        prop::collection::btree_set("[a-z]{1,6}", 1..6).prop_flat_map(|names| {
            let width = names.len();
            let header: Vec<Value> = names.into_iter().map(Value::from).collect();
            prop::collection::vec(prop::collection::vec(cell(), width), 1..6).prop_map(
                move |rows| {
                    let mut all = vec![Value::Array(header.clone())];
                    all.extend(rows.into_iter().map(Value::Array));
                    Value::Array(all)
                },
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn columnar_round_trips(x in columnar()) {
            prop_assert!(is_columnar(&x));
            let expanded = deserialize(&x).unwrap();
            prop_assert_eq!(serialize(&expanded), Some(x));
        }
    }
}
