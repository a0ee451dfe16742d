use fnv::FnvHashMap;

/// Key/value connection parameters: the pairs a client sends in its
/// startup message, or the ParameterStatus values a server reports.
/// Iteration order is unspecified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerParams {
    params: FnvHashMap<String, String>,
}

impl ServerParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, k: &str, v: &str) {
        self.params.insert(k.to_string(), v.to_string());
    }

    pub fn get<'a>(&'a self, k: &'_ str) -> Option<&'a str> {
        self.params.get(k).map(|v| v.as_str())
    }

    pub fn contains(&self, k: &str) -> bool {
        self.params.contains_key(k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
