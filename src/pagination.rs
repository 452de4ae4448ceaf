//! Pagination utility for postfan.
//!
//! Groups rendered lines into maximal pages under a byte budget, for
//! command surfaces whose message fields cap out at a fixed size (chat
//! embeds, terminal screens). Replaces ad-hoc accumulate-and-split string
//! concatenation at call sites.

/// Default page budget in bytes, matching common chat embed field limits.
pub const DEFAULT_PAGE_BUDGET: usize = 1024;

/// Split items into maximal consecutive groups whose joined length stays
/// within `budget` bytes.
///
/// Items are joined with `separator`; the separator between two items
/// counts toward the budget. An item that alone exceeds the budget gets a
/// page of its own rather than being dropped. Empty input yields no
/// pages.
pub fn paginate<S: AsRef<str>>(items: &[S], separator: &str, budget: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut current = String::new();

    for item in items {
        let item = item.as_ref();
        if current.is_empty() {
            current.push_str(item);
            continue;
        }

        if current.len() + separator.len() + item.len() <= budget {
            current.push_str(separator);
            current.push_str(item);
        } else {
            pages.push(std::mem::take(&mut current));
            current.push_str(item);
        }
    }

    if !current.is_empty() {
        pages.push(current);
    }

    pages
}
