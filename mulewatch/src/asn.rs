// mulewatch/src/asn.rs
//
// Offline IPv4 → ASN resolution and classification.
//
// Legitimate retail senders transact from mobile carriers and residential
// broadband. Mule herders and scripted cash-out rings run from cloud
// compute, VPS ranges, and foreign networks — so the resolved ASN carries
// a base risk, sharpened by how the account has used networks over time:
//
//   density  — distinct accounts recently seen on the same ASN
//   drift    — current ASN differs from the account's modal ASN
//   entropy  — spread of the account's ASN-use histogram
//
// The database is an ip2asn-style TSV (range_start, range_end, as_number,
// country, org — dotted quads or raw integers), memory-mapped and parsed
// once into a sorted interval table. Absent database = zero contribution;
// the engine stays fully operational.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use memmap2::Mmap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use std::collections::VecDeque;

// ── Classification ────────────────────────────────────────────────────────────
// Org-name prefixes, lowercased. Domestic carriers first; the cloud and
// hosting lists mirror the providers cash-out tooling actually runs on.

const MOBILE_ORGS: &[&str] = &[
    "jio", "reliance jio", "bharti airtel", "airtel", "vodafone", "idea cellular",
];

const BROADBAND_ORGS: &[&str] = &[
    "bsnl", "mtnl", "hathway", "act fibernet", "atria convergence", "excitel",
    "tikona", "den networks", "gtpl",
];

const ENTERPRISE_ORGS: &[&str] = &[
    "tata communications", "sify", "railtel", "powergrid", "national informatics",
];

const CLOUD_ORGS: &[&str] = &[
    "amazon", "aws", "google", "gcp", "microsoft", "azure", "alibaba",
    "oracle cloud", "tencent cloud",
];

const HOSTING_ORGS: &[&str] = &[
    "digitalocean", "linode", "akamai", "vultr", "choopa", "hetzner", "ovh",
    "scaleway", "contabo", "leaseweb", "m247", "quadranet", "psychz",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsnClass {
    Mobile,
    Broadband,
    Enterprise,
    InCloud,
    Hosting,
    UnknownDomestic,
    Foreign,
}

impl AsnClass {
    pub fn base_risk(&self) -> f64 {
        match self {
            Self::Mobile          => 0.0,
            Self::Broadband       => 0.1,
            Self::Enterprise      => 0.3,
            Self::InCloud         => 0.6,
            Self::Hosting         => 0.7,
            Self::UnknownDomestic => 0.5,
            Self::Foreign         => 0.8,
        }
    }
}

fn classify_org(org: &str) -> AsnClass {
    let lower = org.to_lowercase();
    if HOSTING_ORGS.iter().any(|p| lower.contains(p))    { return AsnClass::Hosting; }
    if CLOUD_ORGS.iter().any(|p| lower.contains(p))      { return AsnClass::InCloud; }
    if ENTERPRISE_ORGS.iter().any(|p| lower.contains(p)) { return AsnClass::Enterprise; }
    if BROADBAND_ORGS.iter().any(|p| lower.contains(p))  { return AsnClass::Broadband; }
    if MOBILE_ORGS.iter().any(|p| lower.contains(p))     { return AsnClass::Mobile; }
    AsnClass::UnknownDomestic
}

// ── Database ──────────────────────────────────────────────────────────────────

struct AsnRange {
    start:   u32,
    end:     u32,
    asn:     u32,
    country: String,
    org:     String,
}

pub struct AsnDb {
    ranges: Vec<AsnRange>,
    // Keeps the mapping alive for the lifetime of the parsed table.
    _mmap:  Mmap,
}

impl AsnDb {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let text = std::str::from_utf8(&mmap)?;

        let mut ranges = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') { continue; }
            let mut cols = line.split('\t');
            let (Some(start), Some(end), Some(asn)) = (cols.next(), cols.next(), cols.next()) else {
                warn!("asn db line {}: short row, skipped", lineno + 1);
                continue;
            };
            let country = cols.next().unwrap_or("").to_string();
            let org     = cols.next().unwrap_or("").to_string();
            let (Some(start), Some(end), Ok(asn)) =
                (parse_ip_or_int(start), parse_ip_or_int(end), asn.parse::<u32>()) else {
                warn!("asn db line {}: unparsable row, skipped", lineno + 1);
                continue;
            };
            ranges.push(AsnRange { start, end, asn, country, org });
        }
        ranges.sort_by_key(|r| r.start);
        info!("asn db loaded: {} ranges from {}", ranges.len(), path.display());
        Ok(Self { ranges, _mmap: mmap })
    }

    fn lookup(&self, ip: u32) -> Option<&AsnRange> {
        let idx = self.ranges.partition_point(|r| r.start <= ip);
        if idx == 0 { return None; }
        let r = &self.ranges[idx - 1];
        (ip <= r.end && r.asn != 0).then_some(r)
    }
}

fn parse_ip_or_int(s: &str) -> Option<u32> {
    if let Ok(ip) = s.parse::<Ipv4Addr>() {
        return Some(u32::from(ip));
    }
    s.parse::<u32>().ok()
}

// ── Assessment ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AsnAssessment {
    pub asn:          Option<u32>,
    pub org:          String,
    pub country:      String,
    pub class:        AsnClass,
    pub foreign:      bool,
    pub base:         f64,
    pub density:      f64,
    pub drift:        f64,
    pub entropy_norm: f64,
    pub risk:         f64,
}

impl AsnAssessment {
    /// Scaled contribution to the behavioural score.
    pub fn contribution(&self) -> f64 {
        self.risk * 20.0
    }

    /// True when the rule-level "risky network" predicate fires.
    pub fn is_risky(&self) -> bool {
        self.foreign
            || matches!(self.class, AsnClass::InCloud | AsnClass::Hosting)
            || self.risk >= 0.6
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

/// Density window: an account counts toward an ASN's density for 24 h.
const USAGE_WINDOW_HOURS: i64 = 24;

pub struct AsnResolver {
    db:       Option<AsnDb>,
    domestic: String,
    /// asn → recent (ts, account) uses, pruned by housekeeping.
    usage:    DashMap<u32, Arc<RwLock<VecDeque<(DateTime<Utc>, String)>>>>,
    /// account → asn-use histogram (modal ASN + entropy source).
    history:  DashMap<String, HashMap<u32, u32>>,
}

impl AsnResolver {
    pub fn new(db_path: Option<&Path>, domestic_country: &str) -> Arc<Self> {
        let db = match db_path {
            Some(p) => match AsnDb::load(p) {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!("asn db unavailable ({e}); network scoring contributes zero");
                    None
                }
            },
            None => {
                info!("no asn db configured; network scoring contributes zero");
                None
            }
        };
        Arc::new(Self {
            db,
            domestic: domestic_country.to_string(),
            usage:    DashMap::new(),
            history:  DashMap::new(),
        })
    }

    pub fn has_db(&self) -> bool { self.db.is_some() }

    /// Full per-lookup pipeline: validate → lookup → country filter →
    /// classify → density → drift → entropy → fuse.
    pub fn assess(&self, account: &str, ip_address: &str, now: DateTime<Utc>) -> Option<AsnAssessment> {
        let db = self.db.as_ref()?;
        let ip: Ipv4Addr = ip_address.parse().ok()?;
        if !is_routable(ip) { return None; }

        let hit = db.lookup(u32::from(ip));

        let (asn, org, country) = match hit {
            Some(r) => (Some(r.asn), r.org.clone(), r.country.clone()),
            None    => (None, String::new(), self.domestic.clone()),
        };

        let foreign = !country.is_empty() && country != self.domestic;
        let class = if foreign {
            AsnClass::Foreign
        } else if hit.is_some() {
            classify_org(&org)
        } else {
            AsnClass::UnknownDomestic
        };
        let base = class.base_risk();

        // density + history only for resolved ASNs
        let density = match asn {
            Some(asn) => {
                self.record_usage(asn, account, now);
                let n = self.distinct_accounts(asn, now);
                ((1.0 + n as f64).ln() / 1001f64.ln()).clamp(0.0, 1.0)
            }
            None => 0.0,
        };

        let (drift, entropy_norm) = match asn {
            Some(asn) => {
                let mut hist = self.history.entry(account.to_string()).or_default();
                *hist.entry(asn).or_insert(0) += 1;
                // ties resolve to the lowest ASN so the modal pick is stable
                let modal = hist.iter()
                    .max_by_key(|(a, c)| (**c, std::cmp::Reverse(**a)))
                    .map(|(a, _)| *a);
                let drift = if modal == Some(asn) { 0.0 } else { 1.0 };
                (drift, entropy_norm(&hist))
            }
            None => {
                let e = self.history.get(account)
                    .map(|h| entropy_norm(&h))
                    .unwrap_or(0.0);
                (0.0, e)
            }
        };

        let risk = (0.4 * base
            + 0.3 * density
            + 0.2 * drift
            + 0.2 * if foreign { 1.0 } else { 0.0 }
            + 0.1 * entropy_norm)
            .clamp(0.0, 1.0);

        Some(AsnAssessment { asn, org, country, class, foreign, base, density, drift, entropy_norm, risk })
    }

    fn record_usage(&self, asn: u32, account: &str, now: DateTime<Utc>) {
        let window = self.usage.entry(asn).or_default().clone();
        let mut w = window.write();
        w.push_back((now, account.to_string()));
        let cutoff = now - Duration::hours(USAGE_WINDOW_HOURS);
        while w.front().map(|(ts, _)| *ts < cutoff).unwrap_or(false) {
            w.pop_front();
        }
    }

    fn distinct_accounts(&self, asn: u32, now: DateTime<Utc>) -> usize {
        let Some(window) = self.usage.get(&asn).map(|w| w.clone()) else { return 0 };
        let cutoff = now - Duration::hours(USAGE_WINDOW_HOURS);
        let w = window.read();
        w.iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, a)| a.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    /// Drop usage entries older than the density window.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(USAGE_WINDOW_HOURS);
        for entry in self.usage.iter() {
            let mut w = entry.value().write();
            while w.front().map(|(ts, _)| *ts < cutoff).unwrap_or(false) {
                w.pop_front();
            }
        }
    }
}

/// Entropy of the use histogram, normalized against ln(12).
fn entropy_norm(hist: &HashMap<u32, u32>) -> f64 {
    let total: u32 = hist.values().sum();
    if total == 0 { return 0.0; }
    let h: f64 = hist.values()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * p.ln()
        })
        .sum();
    (h / 12f64.ln()).min(1.0)
}

fn is_routable(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || octets[0] >= 240            // 240.0.0.0/4 reserved
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))) // CGNAT
}
