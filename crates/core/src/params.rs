use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named runtime parameters for one benchmark run, e.g. `burst_size` or
/// `data_size`. Keys are kept ordered so the serialized form and the generated
/// command line are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, String>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fills in any parameter the caller did not provide from the operation's
    /// documented defaults. Explicit values always win.
    pub fn merge_defaults(&mut self, defaults: &BTreeMap<String, String>) {
        for (key, value) in defaults {
            self.0
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Benchmark-args for the generated executable: `--<key> <value>` pairs,
    /// in key order.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len() * 2);
        for (key, value) in &self.0 {
            args.push(format!("--{key}"));
            args.push(value.clone());
        }
        args
    }

    /// Canonical `k1=v1,k2=v2` form, used to group samples by parameter tuple.
    pub fn tuple_key(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<(String, String)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One swept parameter: a name and the values to sweep over.
#[derive(Debug, Clone)]
pub struct SweepSpec {
    pub name: String,
    pub values: Vec<String>,
}

impl std::str::FromStr for SweepSpec {
    type Err = String;

    /// Parses `key=v1,v2,v3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, values) = s
            .split_once('=')
            .ok_or_else(|| format!("expected `key=v1,v2,...`, got `{s}`"))?;
        if name.is_empty() {
            return Err(format!("empty parameter name in `{s}`"));
        }
        let values: Vec<String> = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .collect();
        if values.is_empty() {
            return Err(format!("no values for parameter `{name}`"));
        }
        Ok(SweepSpec {
            name: name.trim().to_owned(),
            values,
        })
    }
}

/// Expands sweep specs into the cartesian product of parameter tuples.
/// With no specs this yields a single empty set, so every operation runs at
/// least once with its defaults.
pub fn expand_sweep(specs: &[SweepSpec]) -> Vec<ParameterSet> {
    use itertools::Itertools;

    if specs.is_empty() {
        return vec![ParameterSet::new()];
    }
    specs
        .iter()
        .map(|spec| {
            spec.values
                .iter()
                .map(move |v| (spec.name.clone(), v.clone()))
                .collect::<Vec<_>>()
        })
        .multi_cartesian_product()
        .map(|combo| combo.into_iter().collect())
        .collect()
}
