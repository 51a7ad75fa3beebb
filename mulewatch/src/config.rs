// mulewatch/src/config.rs
//
// Engine configuration. Every field has a compiled default and an
// environment-variable override (MW_*); the CLI only selects run mode and
// input paths. Fusion weights and thresholds are configuration, not code
// constants — the fusion core reads them, never hardcodes them.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // workers / stream
    pub workers:               usize,
    pub worker_batch:          usize,
    pub stream_key:            String,
    pub consumer_group:        String,

    // graph store
    pub store_uri:             String,
    pub store_pool:            usize,

    // fusion weights — must sum to 1
    pub weight_graph:          f64,
    pub weight_behavioral:     f64,
    pub weight_device:         f64,
    pub weight_dead:           f64,
    pub weight_velocity:       f64,

    // thresholds
    pub high_threshold:        f64,
    pub medium_threshold:      f64,
    pub dormancy_days:         i64,
    pub velocity_window_secs:  i64,
    pub burst_threshold:       u32,
    pub impossible_kmh:        f64,

    // v3 signal parameters
    pub multi_user_threshold:  usize,
    pub multi_user_penalty:    f64,
    pub circadian_penalty:     f64,
    pub circadian_compound:    f64,
    pub identical_min_count:   usize,
    pub identical_penalty:     f64,
    pub sleep_flash_ratio:     f64,
    pub new_device_high_amount: f64,
    pub endpoint_rotation_max: usize,

    // batch analyzer
    pub analyzer_interval_secs: u64,
    pub router_betweenness:     f64,

    // worker timing / backpressure
    pub record_deadline_ms:     u64,
    pub pending_high_water:     usize,
    pub visibility_timeout_ms:  u64,

    // locale
    pub domestic_country:       String,
    pub utc_offset_minutes:     i32,

    // I/O
    pub asn_db_path:            Option<String>,
    pub bind_addr:              String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers:                4,
            worker_batch:           16,
            stream_key:             "mw:transactions".into(),
            consumer_group:         "scorers".into(),
            store_uri:              "memory://local".into(),
            store_pool:             50,
            weight_graph:           0.30,
            weight_behavioral:      0.25,
            weight_device:          0.20,
            weight_dead:            0.15,
            weight_velocity:        0.10,
            high_threshold:         70.0,
            medium_threshold:       40.0,
            dormancy_days:          30,
            velocity_window_secs:   60,
            burst_threshold:        10,
            impossible_kmh:         250.0,
            multi_user_threshold:   3,
            multi_user_penalty:     25.0,
            circadian_penalty:      20.0,
            circadian_compound:     35.0,
            identical_min_count:    3,
            identical_penalty:      30.0,
            sleep_flash_ratio:      50.0,
            new_device_high_amount: 10_000.0,
            endpoint_rotation_max:  5,
            analyzer_interval_secs: 5,
            router_betweenness:     0.01,
            record_deadline_ms:     200,
            pending_high_water:     1000,
            visibility_timeout_ms:  30_000,
            domestic_country:       "IN".into(),
            utc_offset_minutes:     330,
            asn_db_path:            None,
            bind_addr:              "0.0.0.0:8080".into(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, into: &mut T) {
    if let Ok(raw) = env::var(key) {
        if let Ok(v) = raw.parse::<T>() {
            *into = v;
        } else {
            tracing::warn!("ignoring unparsable {}={}", key, raw);
        }
    }
}

impl Config {
    /// Defaults overridden by any MW_* environment variables present.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut c = Self::default();

        env_parse("MW_WORKERS",                &mut c.workers);
        env_parse("MW_WORKER_BATCH",           &mut c.worker_batch);
        env_parse("MW_STREAM_KEY",             &mut c.stream_key);
        env_parse("MW_CONSUMER_GROUP",         &mut c.consumer_group);
        env_parse("MW_STORE_URI",              &mut c.store_uri);
        env_parse("MW_STORE_POOL",             &mut c.store_pool);
        env_parse("MW_WEIGHT_GRAPH",           &mut c.weight_graph);
        env_parse("MW_WEIGHT_BEHAVIORAL",      &mut c.weight_behavioral);
        env_parse("MW_WEIGHT_DEVICE",          &mut c.weight_device);
        env_parse("MW_WEIGHT_DEAD",            &mut c.weight_dead);
        env_parse("MW_WEIGHT_VELOCITY",        &mut c.weight_velocity);
        env_parse("MW_HIGH_THRESHOLD",         &mut c.high_threshold);
        env_parse("MW_MEDIUM_THRESHOLD",       &mut c.medium_threshold);
        env_parse("MW_DORMANCY_DAYS",          &mut c.dormancy_days);
        env_parse("MW_VELOCITY_WINDOW_SECS",   &mut c.velocity_window_secs);
        env_parse("MW_BURST_THRESHOLD",        &mut c.burst_threshold);
        env_parse("MW_IMPOSSIBLE_KMH",         &mut c.impossible_kmh);
        env_parse("MW_MULTI_USER_THRESHOLD",   &mut c.multi_user_threshold);
        env_parse("MW_MULTI_USER_PENALTY",     &mut c.multi_user_penalty);
        env_parse("MW_CIRCADIAN_PENALTY",      &mut c.circadian_penalty);
        env_parse("MW_CIRCADIAN_COMPOUND",     &mut c.circadian_compound);
        env_parse("MW_IDENTICAL_MIN_COUNT",    &mut c.identical_min_count);
        env_parse("MW_IDENTICAL_PENALTY",      &mut c.identical_penalty);
        env_parse("MW_SLEEP_FLASH_RATIO",      &mut c.sleep_flash_ratio);
        env_parse("MW_NEW_DEVICE_HIGH_AMOUNT", &mut c.new_device_high_amount);
        env_parse("MW_ENDPOINT_ROTATION_MAX",  &mut c.endpoint_rotation_max);
        env_parse("MW_ANALYZER_INTERVAL_SECS", &mut c.analyzer_interval_secs);
        env_parse("MW_ROUTER_BETWEENNESS",     &mut c.router_betweenness);
        env_parse("MW_RECORD_DEADLINE_MS",     &mut c.record_deadline_ms);
        env_parse("MW_PENDING_HIGH_WATER",     &mut c.pending_high_water);
        env_parse("MW_VISIBILITY_TIMEOUT_MS",  &mut c.visibility_timeout_ms);
        env_parse("MW_DOMESTIC_COUNTRY",       &mut c.domestic_country);
        env_parse("MW_UTC_OFFSET_MINUTES",     &mut c.utc_offset_minutes);
        env_parse("MW_BIND_ADDR",              &mut c.bind_addr);
        if let Ok(path) = env::var("MW_ASN_DB") {
            if !path.is_empty() { c.asn_db_path = Some(path); }
        }

        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let weight_sum = self.weight_graph + self.weight_behavioral + self.weight_device
            + self.weight_dead + self.weight_velocity;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::InvalidInput(format!(
                "fusion weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if self.workers == 0 || self.worker_batch == 0 {
            return Err(EngineError::InvalidInput("workers and worker_batch must be positive".into()));
        }
        for (name, v) in [("high_threshold", self.high_threshold),
                          ("medium_threshold", self.medium_threshold)] {
            if !(0.0..=100.0).contains(&v) {
                return Err(EngineError::InvalidInput(format!("{name} out of [0,100]: {v}")));
            }
        }
        if self.medium_threshold > self.high_threshold {
            return Err(EngineError::InvalidInput("medium_threshold above high_threshold".into()));
        }
        Ok(())
    }

    /// Fusion weights in extractor order: graph, behavioral, device, dead,
    /// velocity.
    pub fn weights(&self) -> [f64; 5] {
        [self.weight_graph, self.weight_behavioral, self.weight_device,
         self.weight_dead, self.weight_velocity]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let c = Config::default();
        assert!(c.validate().is_ok());
        assert!((c.weights().iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weight_sum_is_enforced() {
        let mut c = Config::default();
        c.weight_graph = 0.50;
        assert!(c.validate().is_err());
    }

    #[test]
    fn threshold_ordering_is_enforced() {
        let mut c = Config::default();
        c.medium_threshold = 80.0;
        assert!(c.validate().is_err());
    }
}
