use std::cmp::Ordering;

/// Compare two dotted image versions such as `22.1.0.0.0.220703`.
///
/// Components are compared numerically and a missing trailing component counts
/// as zero, so `22.1.0` equals `22.1.0.0`. Returns `None` when either side has
/// an empty or non-numeric component.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    let left = components(a)?;
    let right = components(b)?;

    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(Ordering::Equal)
}

/// A version is valid when it compares with itself.
pub fn is_valid(v: &str) -> bool {
    components(v).is_some()
}

fn components(v: &str) -> Option<Vec<u64>> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    v.split('.').map(|c| c.parse::<u64>().ok()).collect()
}
