//! Shared fixture: a leaf vtable over an owned name table with observable
//! attach/detach counting.

use std::sync::Mutex;

use dnsqp::{DnsName, LeafMethods, QpKey};

/// Leaves are rows in this table: `ival` is the row index and `pval` is a
/// tagged fake pointer derived from it (the trie never dereferences
/// `pval`, it only hands it back through the vtable). The per-row counter
/// tracks every reference the trie takes, including duplicates made when
/// immutable cells are evacuated.
pub struct NameTable {
    rows: Mutex<Vec<Row>>,
}

struct Row {
    name: DnsName,
    refs: i64,
}

impl NameTable {
    pub fn new() -> Self {
        NameTable {
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Registers a name and returns the leaf to insert for it.
    pub fn add(&self, name: &str) -> (*mut (), u32) {
        let name: DnsName = name.parse().expect("fixture name");
        self.add_name(name)
    }

    pub fn add_name(&self, name: DnsName) -> (*mut (), u32) {
        let mut rows = self.rows.lock().unwrap();
        let ival = rows.len() as u32;
        rows.push(Row { name, refs: 0 });
        (pval_for(ival), ival)
    }

    pub fn leaf(&self, ival: u32) -> (*mut (), u32) {
        (pval_for(ival), ival)
    }

    pub fn name(&self, ival: u32) -> DnsName {
        self.rows.lock().unwrap()[ival as usize].name.clone()
    }

    pub fn key(&self, ival: u32) -> QpKey {
        QpKey::from_name(&self.name(ival))
    }

    pub fn refs(&self, ival: u32) -> i64 {
        self.rows.lock().unwrap()[ival as usize].refs
    }

    pub fn total_refs(&self) -> i64 {
        self.rows.lock().unwrap().iter().map(|row| row.refs).sum()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

fn pval_for(ival: u32) -> *mut () {
    // Non-null and even, as the trie requires.
    (((ival as usize) + 1) << 4) as *mut ()
}

fn ival_for(pval: *mut ()) -> usize {
    (pval as usize >> 4) - 1
}

impl LeafMethods for NameTable {
    fn attach(&self, pval: *mut ()) {
        self.rows.lock().unwrap()[ival_for(pval)].refs += 1;
    }

    fn detach(&self, pval: *mut ()) {
        let mut rows = self.rows.lock().unwrap();
        let row = &mut rows[ival_for(pval)];
        row.refs -= 1;
        assert!(row.refs >= 0, "detach without a matching attach");
    }

    fn leaf_key(&self, _pval: *mut (), ival: u32) -> QpKey {
        QpKey::from_name(&self.rows.lock().unwrap()[ival as usize].name)
    }

    fn tree_name(&self) -> &str {
        "test"
    }
}

/// A spread of names wide enough to split branches at several offsets and
/// deep enough to nest a few zones.
pub fn synthetic_names(count: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(count);
    let tlds = ["com", "net", "org", "example"];
    for i in 0..count {
        let tld = tlds[i % tlds.len()];
        match i % 3 {
            0 => names.push(format!("host-{i}.{tld}")),
            1 => names.push(format!("a{i}.zone{}.{tld}", i % 17)),
            _ => names.push(format!("x{}.y{}.z{i}.{tld}", i % 5, i % 29)),
        }
    }
    names
}
