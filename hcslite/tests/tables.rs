//! Property tests for the utility-VM resource tables.

use std::collections::HashMap;

use hcslite::uvm::plan9::{Plan9Add, Plan9Table};
use hcslite::uvm::scsi::ScsiTable;
use hcslite::uvm::vsmb::{VsmbAdd, VsmbRemove, VsmbTable, share_name};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Add(u8),
    Remove(u8),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..4).prop_map(Op::Add),
            (0u8..4).prop_map(Op::Remove),
        ],
        0..64,
    )
}

fn path(index: u8) -> String {
    format!(r"C:\shares\dir-{}", index)
}

proptest! {
    /// Ref-count equals matched adds minus removes for every key, and the
    /// platform request count is one add per first-reference and one
    /// remove per last-reference, regardless of churn.
    #[test]
    fn vsmb_refcounts_mirror_the_op_history(ops in ops()) {
        let mut table = VsmbTable::new();
        let mut model: HashMap<String, u32> = HashMap::new();
        let mut platform_adds = 0u32;
        let mut platform_removes = 0u32;

        for op in ops {
            match op {
                Op::Add(index) => {
                    let key = path(index).to_lowercase();
                    match table.add(&path(index), 0, None) {
                        VsmbAdd::First { guid } => {
                            prop_assert_eq!(model.get(&key), None);
                            prop_assert_eq!(&guid, &share_name(&path(index)));
                            platform_adds += 1;
                            model.insert(key, 1);
                        }
                        VsmbAdd::Again { ref_count } => {
                            let expected = model.get_mut(&key).expect("known key");
                            *expected += 1;
                            prop_assert_eq!(ref_count, *expected);
                        }
                    }
                }
                Op::Remove(index) => {
                    let key = path(index).to_lowercase();
                    match table.remove(&path(index)) {
                        VsmbRemove::NotFound => {
                            prop_assert_eq!(model.get(&key), None);
                        }
                        VsmbRemove::Decremented { ref_count } => {
                            let expected = model.get_mut(&key).expect("known key");
                            *expected -= 1;
                            prop_assert_eq!(ref_count, *expected);
                        }
                        VsmbRemove::Removed { .. } => {
                            prop_assert_eq!(model.remove(&key), Some(1));
                            platform_removes += 1;
                        }
                    }
                }
            }
        }

        prop_assert_eq!(table.len(), model.len());
        for (key, ref_count) in &model {
            prop_assert_eq!(table.get(key).map(|share| share.ref_count), Some(*ref_count));
        }
        // Every live key cost exactly one platform add; every dead key
        // balanced its add with one remove.
        prop_assert_eq!(platform_adds, platform_removes + model.len() as u32);
    }

    /// Allocate then deallocate returns the slot to the pool, and the next
    /// allocation reuses it.
    #[test]
    fn scsi_slots_round_trip(count in 1usize..200) {
        let mut table = ScsiTable::new();
        table.reserve_scratch("scratch.vhdx");

        let mut slots = Vec::new();
        for i in 0..count {
            slots.push(table.allocate(&format!("d{}.vhdx", i), "").unwrap());
        }
        let (controller, lun) = slots[count / 2];
        table.deallocate(controller, lun).unwrap();
        prop_assert_eq!(table.allocate("again.vhdx", "").unwrap(), (controller, lun));
        prop_assert!(table.find("again.vhdx").is_some());
        // The scratch never moves.
        prop_assert_eq!(table.get(0, 0).host_path.as_str(), "scratch.vhdx");
    }

    /// Ports are never reused, whatever the add/remove interleaving.
    #[test]
    fn plan9_ports_never_repeat(ops in ops()) {
        let mut table = Plan9Table::new();
        let mut seen_ports = Vec::new();

        for op in ops {
            match op {
                Op::Add(index) => {
                    if let Plan9Add::First { port, .. } = table.add(&path(index), "/mnt", false) {
                        prop_assert!(!seen_ports.contains(&port));
                        seen_ports.push(port);
                    }
                }
                Op::Remove(index) => {
                    let _ = table.remove(&path(index));
                }
            }
        }
        let mut sorted = seen_ports.clone();
        sorted.sort_unstable();
        prop_assert_eq!(&sorted, &seen_ports);
    }
}
