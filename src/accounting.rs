use crate::data::{MergedProcessRecord, ProcessMemoryRecord, ProcessUtilizationRecord};
use std::collections::HashMap;

/// Joins the memory accounting list with the utilization accounting list.
///
/// The memory list decides which processes exist: one record per distinct
/// pid, in first-seen order. Utilization entries for pids without a memory
/// record, and the pid 0 sentinel, are dropped. Processes with no
/// utilization entry keep zeroed utilization fields. When a pid has several
/// utilization entries the last one wins.
pub fn merge(
    mem_records: &[ProcessMemoryRecord],
    util_records: &[ProcessUtilizationRecord],
) -> Vec<MergedProcessRecord> {
    let mut merged: Vec<MergedProcessRecord> = Vec::with_capacity(mem_records.len());
    let mut by_pid: HashMap<u32, usize> = HashMap::with_capacity(mem_records.len());

    for record in mem_records {
        if by_pid.contains_key(&record.pid) {
            continue;
        }
        by_pid.insert(record.pid, merged.len());
        merged.push(MergedProcessRecord::from(*record));
    }

    for util in util_records.iter().filter(|u| u.pid != 0) {
        if let Some(&slot) = by_pid.get(&util.pid) {
            merged[slot].apply_utilization(util);
        }
    }

    merged
}
