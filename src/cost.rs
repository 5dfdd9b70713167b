//! Per-URI cost assignment. Queues spend their budget at the assigned cost.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::CrawlUri;

lazy_static! {
    /// Year-month looking fragments: 2019/04, 2019-04, 201904.
    static ref CALENDAR_PATTERN: Regex =
        Regex::new(r"(?:19|20)\d{2}[-/_]?(?:0[1-9]|1[0-2])(?:[-/_]?(?:0[1-9]|[12]\d|3[01]))?")
            .expect("Invalid calendar regex");
}

/// Path depth beyond which the weighted policies charge extra.
const DEEP_PATH_SEGMENTS: usize = 8;

/// The largest cost a store key can carry.
pub const MAX_COST: u32 = u8::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostPolicy {
    /// Every URI is free; budgets never run out.
    Zero,
    /// Every URI costs 1.
    #[default]
    Unit,
    /// 1, plus 1 for a query string, 1 for a repeated path segment and 1 for a very deep path.
    Wag,
    /// Like `Wag`, plus 1 for every calendar-like fragment.
    AntiCalendar,
}

impl CostPolicy {
    pub fn cost_of(&self, curi: &CrawlUri) -> u32 {
        let cost = match self {
            CostPolicy::Zero => 0,
            CostPolicy::Unit => 1,
            CostPolicy::Wag => wag_cost(&curi.uri),
            CostPolicy::AntiCalendar => {
                wag_cost(&curi.uri) + CALENDAR_PATTERN.find_iter(&curi.uri).count() as u32
            }
        };
        cost.min(MAX_COST)
    }

    /// Cost recorded on the URI, assigned on first use.
    pub fn assign(&self, curi: &mut CrawlUri) -> u32 {
        match curi.cost {
            Some(cost) => cost,
            None => {
                let cost = self.cost_of(curi);
                curi.cost = Some(cost);
                cost
            }
        }
    }
}

fn wag_cost(uri: &str) -> u32 {
    let mut cost = 1;
    let Ok(url) = Url::parse(uri) else {
        return cost;
    };

    if url.query().is_some() {
        cost += 1;
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let mut seen = std::collections::HashSet::new();
    if segments.iter().any(|seg| !seen.insert(*seg)) {
        cost += 1;
    }
    if segments.len() > DEEP_PATH_SEGMENTS {
        cost += 1;
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curi(uri: &str) -> CrawlUri {
        CrawlUri::new(uri, "L", None)
    }

    #[test]
    fn test_unit_and_zero() {
        assert_eq!(CostPolicy::Unit.cost_of(&curi("http://a.test/x?y=1")), 1);
        assert_eq!(CostPolicy::Zero.cost_of(&curi("http://a.test/x")), 0);
    }

    #[test]
    fn test_wag_weights() {
        assert_eq!(CostPolicy::Wag.cost_of(&curi("http://a.test/x")), 1);
        assert_eq!(CostPolicy::Wag.cost_of(&curi("http://a.test/x?y=1")), 2);
        assert_eq!(CostPolicy::Wag.cost_of(&curi("http://a.test/a/b/a/c")), 2);
        assert_eq!(
            CostPolicy::Wag.cost_of(&curi("http://a.test/1/2/3/4/5/6/7/8/9?q")),
            3
        );
    }

    #[test]
    fn test_anti_calendar_charges_dates() {
        let plain = CostPolicy::AntiCalendar.cost_of(&curi("http://a.test/events"));
        let dated = CostPolicy::AntiCalendar.cost_of(&curi("http://a.test/events/2019/04/12"));
        assert_eq!(plain, 1);
        assert!(dated > plain);
    }

    #[test]
    fn test_assign_is_sticky() {
        let mut uri = curi("http://a.test/x?y");
        assert_eq!(CostPolicy::Wag.assign(&mut uri), 2);
        assert_eq!(CostPolicy::Unit.assign(&mut uri), 2);
    }

    #[test]
    fn test_policy_names() {
        let policy: CostPolicy = serde_json::from_str("\"anticalendar\"").unwrap();
        assert_eq!(policy, CostPolicy::AntiCalendar);
    }
}
