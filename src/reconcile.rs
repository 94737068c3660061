use crate::state::{Segment, SyncCursor, Uid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Identifiers to fetch, oldest pending segment first.
    pub to_download: Vec<Uid>,
    /// Cursor with everything newly listed recorded as pending.
    pub cursor: SyncCursor,
    /// The stored cursor was thrown away because UIDVALIDITY changed.
    pub reset: bool,
}

/// Works out which listed identifiers still need downloading.
///
/// Identifiers newer than the cursor's `newest` are turned into a pending
/// segment right away, so the returned cursor can be checkpointed before the
/// first fetch and an interrupted run resumes where it stopped.
pub fn reconcile(listed: &[Uid], uid_validity: Option<u32>, prior: Option<SyncCursor>) -> Plan {
    let mut listed = listed.to_vec();
    listed.sort_unstable();
    listed.dedup();

    let mut reset = false;
    let mut cursor = match prior {
        Some(cursor) if validity_changed(cursor.uid_validity, uid_validity) => {
            reset = true;
            SyncCursor::default()
        }
        Some(cursor) => cursor,
        None => SyncCursor::default(),
    };
    if uid_validity.is_some() {
        cursor.uid_validity = uid_validity;
    }
    cursor.retain_listed(&listed);

    if let (Some(&oldest), Some(&latest)) = (listed.first(), listed.last()) {
        if cursor.newest.map_or(true, |newest| latest > newest) {
            let low = cursor
                .newest
                .map_or(u64::from(oldest), |newest| u64::from(newest) + 1);
            let high = u64::from(latest) + 1;
            match cursor.segments.last_mut() {
                Some(last) if last.high == low => last.high = high,
                _ => cursor.segments.push(Segment::new(high, low)),
            }
            cursor.newest = Some(latest);
        }
    }

    let to_download = pending(&cursor, &listed);
    Plan {
        to_download,
        cursor,
        reset,
    }
}

fn validity_changed(stored: Option<u32>, current: Option<u32>) -> bool {
    match (stored, current) {
        (Some(stored), Some(current)) => stored != current,
        _ => false,
    }
}

/// Listed identifiers inside the cursor's segments. `listed` must be sorted.
pub fn pending(cursor: &SyncCursor, listed: &[Uid]) -> Vec<Uid> {
    let mut segments = cursor.segments.clone();
    segments.sort_by_key(|s| s.low);
    segments
        .iter()
        .flat_map(|segment| listed.iter().filter(move |&&uid| segment.contains(uid)))
        .cloned()
        .collect()
}
