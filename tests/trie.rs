//! Single-writer trie behaviour: lookups, ordering, branch maintenance,
//! compaction and the attach/detach balance.

mod util;

use std::sync::Arc;

use dnsqp::{CompactMode, DnsName, Qp, QpError, QpKey};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use util::{synthetic_names, NameTable};

fn populated(names: &[String]) -> (Arc<NameTable>, Qp) {
    let table = Arc::new(NameTable::new());
    let mut qp = Qp::new(table.clone());
    for name in names {
        let (pval, ival) = table.add(name);
        qp.insert(pval, ival).unwrap();
    }
    (table, qp)
}

#[test]
fn round_trip() {
    let mut names = synthetic_names(1000);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    names.shuffle(&mut rng);
    let (table, qp) = populated(&names);

    assert_eq!(qp.leaf_count(), names.len() as u64);
    for ival in 0..names.len() as u32 {
        let got = qp.get_by_name(&table.name(ival));
        assert_eq!(got, Some(table.leaf(ival)), "missing {}", table.name(ival));
    }
    assert_eq!(qp.get_by_name(&"absent.example".parse().unwrap()), None);
    assert_eq!(qp.get_by_name(&"host-1.example.com".parse().unwrap()), None);
}

#[test]
fn lookups_fold_case() {
    let table = Arc::new(NameTable::new());
    let mut qp = Qp::new(table.clone());
    let (pval, ival) = table.add("MiXeD.ExAmPlE.CoM");
    qp.insert(pval, ival).unwrap();

    for variant in ["mixed.example.com", "MIXED.EXAMPLE.COM", "Mixed.Example.Com"] {
        assert_eq!(
            qp.get_by_name(&variant.parse().unwrap()),
            Some((pval, ival)),
            "{variant}"
        );
    }
}

#[test]
fn iteration_is_canonical_order() {
    let mut names = synthetic_names(500);
    names.push("com".into());
    names.push("com.".into());
    names.push("a.a.a.a".into());
    let mut rng = rand::rngs::StdRng::seed_from_u64(99);
    names.shuffle(&mut rng);
    let (table, qp) = populated(&names);

    let mut expected: Vec<u32> = (0..names.len() as u32).collect();
    expected.sort_by_key(|&ival| table.key(ival));
    let walked: Vec<u32> = qp.iter().map(|(_, ival)| ival).collect();
    assert_eq!(walked, expected);
}

#[test]
fn double_insert_is_exists() {
    let table = Arc::new(NameTable::new());
    let mut qp = Qp::new(table.clone());
    let (pval, ival) = table.add("dup.example");
    qp.insert(pval, ival).unwrap();
    let refs_before = table.refs(ival);

    // Same key under case folding, different leaf.
    let (p2, i2) = table.add("DUP.example");
    assert_eq!(qp.insert(p2, i2), Err(QpError::Exists));
    assert_eq!(table.refs(ival), refs_before);
    assert_eq!(table.refs(i2), 0);
    assert_eq!(qp.leaf_count(), 1);
}

#[test]
fn delete_then_reinsert_matches_single_insert() {
    let names = synthetic_names(64);
    let (table, mut qp) = populated(&names);
    let target = 17u32;

    qp.delete_by_name(&table.name(target)).unwrap();
    assert_eq!(qp.get_by_name(&table.name(target)), None);
    let (pval, _) = table.leaf(target);
    qp.insert(pval, target).unwrap();

    let (reference_table, reference) = populated(&names);
    let walked: Vec<u32> = qp.iter().map(|(_, ival)| ival).collect();
    let expected: Vec<u32> = reference.iter().map(|(_, ival)| ival).collect();
    assert_eq!(walked, expected);
    assert_eq!(qp.leaf_count(), reference.leaf_count());
    drop(reference);
    assert_eq!(reference_table.total_refs(), 0);
}

#[test]
fn delete_collapses_two_twig_branches() {
    let table = Arc::new(NameTable::new());
    let mut qp = Qp::new(table.clone());
    let (px, ix) = table.add("x.example");
    let (py, iy) = table.add("y.example");
    qp.insert(px, ix).unwrap();
    qp.insert(py, iy).unwrap();
    assert_eq!(qp.memusage().live, 3); // root cell plus a two-twig vector

    qp.delete_by_name(&table.name(iy)).unwrap();
    // The branch must have been replaced by the surviving leaf: exactly
    // the root cell remains live.
    assert_eq!(qp.memusage().live, 1);
    assert_eq!(qp.get_by_name(&table.name(ix)), Some((px, ix)));
    assert_eq!(qp.get_by_name(&table.name(iy)), None);
    assert_eq!(table.refs(iy), 0);
}

#[test]
fn delete_to_empty_and_back() {
    let table = Arc::new(NameTable::new());
    let mut qp = Qp::new(table.clone());
    assert_eq!(
        qp.delete_by_name(&"nothing.example".parse().unwrap()),
        Err(QpError::NotFound)
    );

    let (pval, ival) = table.add("only.example");
    qp.insert(pval, ival).unwrap();
    qp.delete_by_name(&table.name(ival)).unwrap();
    assert_eq!(qp.leaf_count(), 0);
    assert_eq!(qp.get_by_name(&table.name(ival)), None);
    assert_eq!(table.refs(ival), 0);

    qp.insert(pval, ival).unwrap();
    assert_eq!(qp.get_by_name(&table.name(ival)), Some((pval, ival)));
}

#[test]
fn escaped_bytes_are_exact() {
    let table = Arc::new(NameTable::new());
    let mut qp = Qp::new(table.clone());
    let weird = DnsName::from_labels([&[b'w', 0xff, b'w'][..], b"example"], false).unwrap();
    let near = DnsName::from_labels([&[b'w', 0xfe, b'w'][..], b"example"], false).unwrap();
    let (pval, ival) = table.add_name(weird.clone());
    qp.insert(pval, ival).unwrap();

    assert_eq!(qp.get_by_name(&weird), Some((pval, ival)));
    assert_eq!(qp.get_by_name(&near), None);
    assert_eq!(qp.get_by_key(&QpKey::from_name(&near)), None);
}

#[test]
fn absolute_and_relative_coexist() {
    let table = Arc::new(NameTable::new());
    let mut qp = Qp::new(table.clone());
    let (pr, ir) = table.add("example.com");
    let (pa, ia) = table.add("example.com.");
    qp.insert(pr, ir).unwrap();
    qp.insert(pa, ia).unwrap();

    assert_eq!(qp.get_by_name(&"example.com".parse().unwrap()), Some((pr, ir)));
    assert_eq!(qp.get_by_name(&"example.com.".parse().unwrap()), Some((pa, ia)));
}

#[test]
fn counters_stay_consistent() {
    let names = synthetic_names(2000);
    let (table, mut qp) = populated(&names);

    let check = |qp: &Qp| {
        let m = qp.memusage();
        assert!(m.free <= m.used, "{m:?}");
        assert!(m.hold <= m.free, "{m:?}");
        assert_eq!(m.live, m.used - m.free);
    };
    check(&qp);
    for ival in 0..1500u32 {
        qp.delete_by_name(&table.name(ival)).unwrap();
    }
    check(&qp);
    qp.compact(CompactMode::All);
    check(&qp);
    for ival in 1500..2000u32 {
        assert_eq!(qp.get_by_name(&table.name(ival)), Some(table.leaf(ival)));
    }
}

#[test]
fn full_compaction_defragments() {
    let names = synthetic_names(10_000);
    let (table, mut qp) = populated(&names);
    let grown = qp.memusage();

    for ival in 0..9500u32 {
        qp.delete_by_name(&table.name(ival)).unwrap();
    }
    qp.compact(CompactMode::All);
    let shrunk = qp.memusage();

    assert_eq!(shrunk.leaves, 500);
    // Everything live fits in the bump chunk after a full pass.
    assert!(shrunk.chunk_count <= 2, "{shrunk:?}");
    assert!(shrunk.bytes < grown.bytes, "{grown:?} -> {shrunk:?}");
    let survivors: Vec<u32> = qp.iter().map(|(_, ival)| ival).collect();
    assert_eq!(survivors.len(), 500);
    for ival in survivors {
        assert_eq!(qp.get_by_name(&table.name(ival)), Some(table.leaf(ival)));
    }
    assert!(qp.timers().compact_ns > 0);
}

#[test]
fn destruction_balances_all_references() {
    let names = synthetic_names(3000);
    let (table, mut qp) = populated(&names);
    for ival in 0..1000u32 {
        qp.delete_by_name(&table.name(ival)).unwrap();
    }
    qp.compact(CompactMode::Maybe);
    assert!(table.total_refs() >= 2000);
    drop(qp);
    assert_eq!(table.total_refs(), 0);
}
