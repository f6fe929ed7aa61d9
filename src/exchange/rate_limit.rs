// =============================================================================
// Request budget — tracks exchange rate-limit headers to avoid 429s
// =============================================================================
//
// The exchange enforces a request-weight budget per minute plus order-count
// caps. The tracker mirrors the `X-MBX-USED-WEIGHT-1M` / order-count
// response headers into atomics that every caller can check lock-free
// before spending more weight.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

/// Hard ceiling at which further requests are refused locally.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;
/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 300;

/// Lock-free request budget shared by every REST caller.
pub struct RequestBudget {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
}

impl RequestBudget {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
        }
    }

    /// Mirror the rate-limit headers from an exchange response.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    hard_limit = WEIGHT_HARD_LIMIT,
                    "request weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "request weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }
    }

    /// Whether `weight` more units fit under the hard limit.
    pub fn can_spend(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                "request deferred — weight budget exhausted"
            );
        }
        allowed
    }

    /// Whether another order fits under the 10-second cap.
    pub fn can_place_order(&self) -> bool {
        let count = self.order_count_10s.load(Ordering::Relaxed);
        if count >= ORDER_10S_LIMIT {
            warn!(count, limit = ORDER_10S_LIMIT, "order deferred — order-rate cap reached");
            return false;
        }
        true
    }

    /// Count an order locally before the exchange echoes updated headers.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for RequestBudget {
    fn default() -> Self {
        Self::new()
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_refuses_over_limit_until_headers_recover() {
        let budget = RequestBudget::new();
        assert!(budget.can_spend(5));
        budget.used_weight_1m.store(WEIGHT_HARD_LIMIT, Ordering::Relaxed);
        assert!(!budget.can_spend(1));

        // The next response header mirrors a fresh minute window.
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-MBX-USED-WEIGHT-1M",
            reqwest::header::HeaderValue::from_static("10"),
        );
        budget.update_from_headers(&headers);
        assert!(budget.can_spend(1));
    }

    #[test]
    fn order_counter_caps() {
        let budget = RequestBudget::new();
        assert!(budget.can_place_order());
        for _ in 0..ORDER_10S_LIMIT {
            budget.record_order_sent();
        }
        assert!(!budget.can_place_order());
    }
}
