//! Dashboard summaries over the client collection.
//!
//! - [`monthly_trend`]: clients bucketed by creation month, last N months
//! - [`region_distribution`]: clients bucketed by region code, top N regions

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::TrendConfig;
use crate::types::ClientLocation;

/// Client counts for one creation month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendBucket {
    /// Sortable key, "YYYY-MM"
    pub month_key: String,
    /// Short month name for display ("Jan", "Feb", ...)
    pub label: String,
    pub clients: usize,
    pub active: usize,
    pub with_location: usize,
}

/// Client count for one region code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBucket {
    pub region: String,
    pub count: usize,
}

#[derive(Default)]
struct MonthCounts {
    clients: usize,
    active: usize,
    with_location: usize,
}

/// Bucket clients by creation month.
///
/// Clients without a creation date are skipped. Buckets are ascending by
/// month and only the `max_months` most recent are kept.
pub fn monthly_trend(clients: &[ClientLocation], config: &TrendConfig) -> Vec<TrendBucket> {
    let mut months: BTreeMap<(i32, u32), MonthCounts> = BTreeMap::new();
    let mut undated = 0usize;

    for client in clients {
        let Some(created) = client.created_at else {
            undated += 1;
            continue;
        };
        let counts = months.entry((created.year(), created.month())).or_default();
        counts.clients += 1;
        if client.is_active() {
            counts.active += 1;
        }
        if client.location.is_some() {
            counts.with_location += 1;
        }
    }

    if undated > 0 {
        debug!("[Trends] Skipped {} client(s) without a creation date", undated);
    }

    let skip = months.len().saturating_sub(config.max_months);
    months
        .into_iter()
        .skip(skip)
        .map(|((year, month), counts)| TrendBucket {
            month_key: format!("{:04}-{:02}", year, month),
            label: NaiveDate::from_ymd_opt(year, month, 1)
                .map(|d| d.format("%b").to_string())
                .unwrap_or_default(),
            clients: counts.clients,
            active: counts.active,
            with_location: counts.with_location,
        })
        .collect()
}

/// Bucket clients by region code, largest first.
///
/// Missing or blank codes go to `config.unknown_region_label`. Equal counts
/// keep the order in which the regions first appear in `clients`.
pub fn region_distribution(clients: &[ClientLocation], config: &TrendConfig) -> Vec<RegionBucket> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<RegionBucket> = Vec::new();

    for client in clients {
        let region = client
            .region_code
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(&config.unknown_region_label);

        match slots.get(region) {
            Some(&i) => buckets[i].count += 1,
            None => {
                slots.insert(region.to_string(), buckets.len());
                buckets.push(RegionBucket {
                    region: region.to_string(),
                    count: 1,
                });
            }
        }
    }

    // Stable sort keeps first-appearance order among equal counts
    buckets.sort_by(|a, b| b.count.cmp(&a.count));
    buckets.truncate(config.max_regions);
    buckets
}
