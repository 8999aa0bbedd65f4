use std::fmt;

/// Field names whose canonical spelling is not plain title case.
const SPECIAL_CASE: &[&str] = &["CSeq", "RTP-Info", "WWW-Authenticate"];

/// Canonical form of a header field name: title case per `-` separated word,
/// with the RTSP names that have a fixed irregular spelling kept as-is.
pub fn canonical_key(name: &str) -> String {
    let name = name.trim();
    if let Some(special) = SPECIAL_CASE.iter().find(|s| s.eq_ignore_ascii_case(name)) {
        return (*special).to_string();
    }

    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// RTSP header map.
///
/// Keys are canonicalized on write and matched case-insensitively on read.
/// Each key maps to an ordered list of values; insertion order of keys is
/// preserved so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, Vec<String>)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let key = canonical_key(name);
        self.fields
            .iter()
            .position(|(k, _)| *k == key)
            .or_else(|| self.fields.iter().position(|(k, _)| k.eq_ignore_ascii_case(name.trim())))
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.fields[i].1.first())
            .map(String::as_str)
    }

    /// All values for `name` in arrival order.
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(i) => &self.fields[i].1,
            None => &[],
        }
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.fields[i].1 = vec![value],
            None => self.fields.push((canonical_key(name), vec![value])),
        }
    }

    /// Append `value` to the values of `name`.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.fields[i].1.push(value),
            None => self.fields.push((canonical_key(name), vec![value])),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|i| self.fields.remove(i).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate `(key, value)` pairs, one pair per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Merge every value of `other` into `self`, replacing keys present in both.
    pub fn extend(&mut self, other: Header) {
        for (key, values) in other.fields {
            match self.position(&key) {
                Some(i) => self.fields[i].1 = values,
                None => self.fields.push((key, values)),
            }
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in self.iter() {
            write!(f, "{}: {}\r\n", k, v)?;
        }
        Ok(())
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (k, v) in iter {
            header.add(k.as_ref(), v);
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_keys() {
        assert_eq!(canonical_key("content-length"), "Content-Length");
        assert_eq!(canonical_key("TRANSPORT"), "Transport");
        assert_eq!(canonical_key("cseq"), "CSeq");
        assert_eq!(canonical_key("rtp-info"), "RTP-Info");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Header::new();
        h.set("X-Foo", "a");
        assert_eq!(h.get("x-foo"), Some("a"));
        assert_eq!(h.get("X-FOO"), Some("a"));
    }

    #[test]
    fn set_replaces_add_appends() {
        let mut h = Header::new();
        h.add("Public", "OPTIONS");
        h.add("public", "DESCRIBE");
        assert_eq!(h.get_all("Public"), ["OPTIONS", "DESCRIBE"]);
        assert_eq!(h.get("Public"), Some("OPTIONS"));

        h.set("PUBLIC", "PLAY");
        assert_eq!(h.get_all("Public"), ["PLAY"]);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn display_emits_one_line_per_value() {
        let h: Header = [("CSeq", "3"), ("Via", "a"), ("via", "b")].into_iter().collect();
        assert_eq!(h.to_string(), "CSeq: 3\r\nVia: a\r\nVia: b\r\n");
    }
}
