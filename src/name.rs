//! DNS names as length-prefixed label sequences.
//!
//! A name is stored leftmost label first, together with an offset index so
//! labels can be walked in either direction. The trie key codec consumes
//! labels from the root down, which is the reverse of storage order.

use std::fmt;
use std::str::FromStr;

/// Longest permitted label, per RFC 1035.
pub const MAX_LABEL: usize = 63;
/// Longest permitted name on the wire, including the root label byte.
pub const MAX_NAME: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("empty label")]
    EmptyLabel,
    #[error("label longer than {MAX_LABEL} bytes")]
    LabelTooLong,
    #[error("name longer than {MAX_NAME} bytes")]
    NameTooLong,
    #[error("bad escape sequence")]
    BadEscape,
}

/// A DNS name: a sequence of labels, optionally anchored at the root.
///
/// Absolute names carry an implicit empty root label; it is not stored but
/// participates in ordering and keying.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DnsName {
    /// Length-prefixed labels, leftmost first, without the root byte.
    wire: Vec<u8>,
    /// Start of each label within `wire`.
    offsets: Vec<u8>,
    absolute: bool,
}

impl DnsName {
    /// The root name `.`.
    pub fn root() -> Self {
        DnsName {
            wire: Vec::new(),
            offsets: Vec::new(),
            absolute: true,
        }
    }

    /// Builds a name from raw label bytes, leftmost label first.
    pub fn from_labels<'a, I>(labels: I, absolute: bool) -> Result<Self, NameError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut name = DnsName {
            wire: Vec::new(),
            offsets: Vec::new(),
            absolute,
        };
        for label in labels {
            name.push_label(label)?;
        }
        Ok(name)
    }

    fn push_label(&mut self, label: &[u8]) -> Result<(), NameError> {
        if label.is_empty() {
            return Err(NameError::EmptyLabel);
        }
        if label.len() > MAX_LABEL {
            return Err(NameError::LabelTooLong);
        }
        // The root label costs one more byte on the wire.
        if self.wire.len() + 1 + label.len() + 1 > MAX_NAME {
            return Err(NameError::NameTooLong);
        }
        self.offsets.push(self.wire.len() as u8);
        self.wire.push(label.len() as u8);
        self.wire.extend_from_slice(label);
        Ok(())
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Number of labels, not counting the implicit root label.
    pub fn label_count(&self) -> usize {
        self.offsets.len()
    }

    /// Iterates over the labels, leftmost first.
    pub fn labels(&self) -> impl DoubleEndedIterator<Item = &[u8]> {
        self.offsets.iter().map(move |&off| {
            let off = off as usize;
            let len = self.wire[off] as usize;
            &self.wire[off + 1..off + 1 + len]
        })
    }
}

impl FromStr for DnsName {
    type Err = NameError;

    /// Parses presentation format. `\.` keeps a dot inside a label and
    /// `\DDD` (three decimal digits) escapes an arbitrary byte. A trailing
    /// unescaped dot makes the name absolute; `.` alone is the root.
    fn from_str(s: &str) -> Result<Self, NameError> {
        if s == "." {
            return Ok(DnsName::root());
        }
        let mut name = DnsName {
            wire: Vec::new(),
            offsets: Vec::new(),
            absolute: false,
        };
        let mut label: Vec<u8> = Vec::new();
        let mut bytes = s.bytes();
        let mut saw_final_dot = false;
        while let Some(b) = bytes.next() {
            match b {
                b'.' => {
                    name.push_label(&label)?;
                    label.clear();
                    if bytes.len() == 0 {
                        saw_final_dot = true;
                    }
                }
                b'\\' => {
                    let first = bytes.next().ok_or(NameError::BadEscape)?;
                    if first.is_ascii_digit() {
                        let d2 = bytes.next().ok_or(NameError::BadEscape)?;
                        let d3 = bytes.next().ok_or(NameError::BadEscape)?;
                        if !d2.is_ascii_digit() || !d3.is_ascii_digit() {
                            return Err(NameError::BadEscape);
                        }
                        let value = (first - b'0') as u32 * 100
                            + (d2 - b'0') as u32 * 10
                            + (d3 - b'0') as u32;
                        if value > 255 {
                            return Err(NameError::BadEscape);
                        }
                        label.push(value as u8);
                    } else {
                        label.push(first);
                    }
                }
                _ => label.push(b),
            }
        }
        if saw_final_dot {
            name.absolute = true;
        } else {
            name.push_label(&label)?;
        }
        Ok(name)
    }
}

impl fmt::Display for DnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label_count() == 0 {
            return f.write_str(".");
        }
        for (i, label) in self.labels().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            for &b in label {
                match b {
                    b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                    b' '..=b'~' => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{:03}", b)?,
                }
            }
        }
        if self.absolute {
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DnsName({})", self)
    }
}
