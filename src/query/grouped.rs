use crate::query::Datum;
use crate::query::error::EvalError;

/// Intermediate result of a `group` operation: one reduction per group key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedData {
    groups: Vec<(Datum, Datum)>,
}

impl GroupedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, group: Datum, reduction: Datum) {
        self.groups.push((group, reduction));
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Converts into the pseudotype clients decode grouped results from.
    pub fn into_client_datum(self, array_limit: usize) -> Result<Datum, EvalError> {
        if self.groups.len() > array_limit {
            return Err(EvalError::generic(format!(
                "Grouped data over size limit `{array_limit}`.  \
                 Try putting a reduction (like `.reduce` or `.count`) on the end."
            )));
        }
        let data = self
            .groups
            .into_iter()
            .map(|(group, reduction)| Datum::Array(vec![group, reduction]))
            .collect();
        Ok(serde_json::json!({
            "$reql_type$": "GROUPED_DATA",
            "data": Datum::Array(data),
        }))
    }
}

impl FromIterator<(Datum, Datum)> for GroupedData {
    fn from_iter<I: IntoIterator<Item = (Datum, Datum)>>(iter: I) -> Self {
        Self {
            groups: iter.into_iter().collect(),
        }
    }
}
