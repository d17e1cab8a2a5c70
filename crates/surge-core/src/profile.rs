//! Traffic Profiles and the Profile Catalog
//!
//! A [`ProfileSpec`] is the raw configuration entry; [`Profile`] is the
//! validated, immutable form shared read-only (`Arc<Profile>`) by every
//! campaign that runs it. Validation precomputes the cumulative weight table
//! used for protocol selection.

use crate::error::{CatalogError, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Tolerance for the protocol weight sum.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Largest configurable payload. Oversized anomalies go above this but stay
/// inside a single IPv4 datagram.
pub const MAX_PROFILE_PAYLOAD: u32 = 65_000;

/// Upper bound on the jitter factor. Past this the delay distribution is
/// mostly zero-length bursts separated by very long gaps.
pub const MAX_BURSTINESS: f64 = 100.0;

/// Destination ports used when a profile does not list its own.
pub const DEFAULT_PORTS: [u16; 4] = [80, 443, 22, 3389];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[serde(alias = "tcp")]
    Tcp,
    #[serde(alias = "udp")]
    Udp,
    #[serde(alias = "icmp")]
    Icmp,
    #[serde(alias = "http")]
    Http,
    #[serde(alias = "https")]
    Https,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Tcp,
        Protocol::Udp,
        Protocol::Icmp,
        Protocol::Http,
        Protocol::Https,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }

    /// Sent over a raw IPv4 socket rather than an HTTP client.
    pub fn is_raw(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp | Protocol::Icmp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abnormality applied to an anomalous unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutator {
    OversizedPayload,
    MalformedHeader,
    SourceSpoof,
    AbnormalPort,
}

impl Mutator {
    pub const ALL: [Mutator; 4] = [
        Mutator::OversizedPayload,
        Mutator::MalformedHeader,
        Mutator::SourceSpoof,
        Mutator::AbnormalPort,
    ];
}

/// How long a campaign runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunLimit {
    Count(u64),
    Duration(Duration),
}

impl RunLimit {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            RunLimit::Count(0) => Err(ValidationError::ZeroCount),
            RunLimit::Duration(d) if d.is_zero() => {
                Err(ValidationError::InvalidDuration(d.as_secs_f64()))
            }
            _ => Ok(()),
        }
    }

    /// Build from the two optional config fields; exactly one must be set.
    pub fn from_parts(count: Option<u64>, duration_secs: Option<f64>) -> Result<Self, ValidationError> {
        let limit = match (count, duration_secs) {
            (Some(n), None) => RunLimit::Count(n),
            (None, Some(secs)) => {
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(ValidationError::InvalidDuration(secs));
                }
                let duration = Duration::try_from_secs_f64(secs)
                    .map_err(|_| ValidationError::InvalidDuration(secs))?;
                RunLimit::Duration(duration)
            }
            _ => return Err(ValidationError::RunLimitAmbiguous),
        };
        limit.validate()?;
        Ok(limit)
    }
}

fn default_ports() -> Vec<u16> {
    DEFAULT_PORTS.to_vec()
}

/// Raw profile entry as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    #[serde(default)]
    pub name: String,
    pub protocol_mix: BTreeMap<Protocol, f64>,
    pub target_rate_per_second: f64,
    #[serde(default)]
    pub burstiness: f64,
    /// `[min, max]` in bytes
    pub payload_size_range: (u32, u32),
    #[serde(default)]
    pub anomaly_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutators: Option<Vec<Mutator>>,
}

/// Cumulative-weight table for protocol selection.
///
/// Entries with zero weight are dropped; the final boundary is pinned to
/// exactly 1.0 so every draw in `[0, 1)` maps to a protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    cumulative: Vec<(Protocol, f64)>,
}

impl WeightTable {
    fn new(mix: &BTreeMap<Protocol, f64>) -> Self {
        let total: f64 = mix.values().sum();
        let mut acc = 0.0;
        let mut cumulative: Vec<(Protocol, f64)> = mix
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .map(|(p, w)| {
                acc += w / total;
                (*p, acc)
            })
            .collect();
        if let Some(last) = cumulative.last_mut() {
            last.1 = 1.0;
        }
        Self { cumulative }
    }

    /// Map a uniform draw in `[0, 1)` to a protocol.
    pub fn pick(&self, u: f64) -> Protocol {
        for (protocol, bound) in &self.cumulative {
            if u < *bound {
                return *protocol;
            }
        }
        // non-empty after validation
        self.cumulative
            .last()
            .map(|(p, _)| *p)
            .unwrap_or(Protocol::Tcp)
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.cumulative.iter().map(|(p, _)| *p)
    }
}

/// Validated, immutable traffic profile.
#[derive(Debug, Clone)]
pub struct Profile {
    spec: ProfileSpec,
    limit: RunLimit,
    weights: WeightTable,
    mutators: Vec<Mutator>,
    interval: Duration,
}

impl Profile {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProfileSpec {
        &self.spec
    }

    pub fn protocol_mix(&self) -> &BTreeMap<Protocol, f64> {
        &self.spec.protocol_mix
    }

    pub fn target_rate_per_second(&self) -> f64 {
        self.spec.target_rate_per_second
    }

    pub fn burstiness(&self) -> f64 {
        self.spec.burstiness
    }

    pub fn payload_size_range(&self) -> (u32, u32) {
        self.spec.payload_size_range
    }

    pub fn anomaly_rate(&self) -> f64 {
        self.spec.anomaly_rate
    }

    pub fn limit(&self) -> RunLimit {
        self.limit
    }

    pub fn ports(&self) -> &[u16] {
        &self.spec.ports
    }

    pub fn mutators(&self) -> &[Mutator] {
        &self.mutators
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// Nominal inter-emission interval.
    pub fn nominal_interval(&self) -> Duration {
        self.interval
    }
}

impl TryFrom<ProfileSpec> for Profile {
    type Error = ValidationError;

    fn try_from(spec: ProfileSpec) -> Result<Self, Self::Error> {
        validate(spec)
    }
}

/// Check every profile invariant and build the immutable [`Profile`].
pub fn validate(spec: ProfileSpec) -> Result<Profile, ValidationError> {
    if spec.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if spec.protocol_mix.is_empty() {
        return Err(ValidationError::EmptyProtocolMix);
    }
    for (protocol, weight) in &spec.protocol_mix {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(ValidationError::InvalidWeight {
                protocol: protocol.to_string(),
                weight: *weight,
            });
        }
    }
    let sum: f64 = spec.protocol_mix.values().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(ValidationError::WeightSum { sum });
    }

    let rate = spec.target_rate_per_second;
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ValidationError::NonPositiveRate(rate));
    }
    let interval = Duration::try_from_secs_f64(1.0 / rate)
        .map_err(|_| ValidationError::NonPositiveRate(rate))?;
    if !(0.0..=MAX_BURSTINESS).contains(&spec.burstiness) {
        return Err(ValidationError::BurstinessOutOfRange(spec.burstiness));
    }

    let (min, max) = spec.payload_size_range;
    if min > max {
        return Err(ValidationError::InvertedPayloadRange { min, max });
    }
    if max > MAX_PROFILE_PAYLOAD {
        return Err(ValidationError::PayloadTooLarge {
            max,
            limit: MAX_PROFILE_PAYLOAD,
        });
    }

    if !(0.0..=1.0).contains(&spec.anomaly_rate) {
        return Err(ValidationError::AnomalyRateOutOfRange(spec.anomaly_rate));
    }

    let limit = RunLimit::from_parts(spec.count, spec.duration_secs)?;

    if spec.ports.is_empty() {
        return Err(ValidationError::EmptyPorts);
    }
    if let Some(port) = spec.ports.iter().find(|p| **p == 0) {
        return Err(ValidationError::InvalidPort(*port));
    }

    let mutators = match &spec.mutators {
        Some(list) if list.is_empty() => return Err(ValidationError::EmptyMutators),
        Some(list) => list.clone(),
        None => Mutator::ALL.to_vec(),
    };

    let weights = WeightTable::new(&spec.protocol_mix);
    Ok(Profile {
        spec,
        limit,
        weights,
        mutators,
        interval,
    })
}

/// Named, validated profiles. Read-only after load.
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    profiles: HashMap<String, Arc<Profile>>,
}

impl ProfileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a spec without inserting it.
    pub fn validate(spec: ProfileSpec) -> Result<Profile, ValidationError> {
        validate(spec)
    }

    /// Load raw config entries, rejecting malformed ones individually.
    ///
    /// Returns the catalog plus the rejected entries with their reasons.
    pub fn from_entries(
        entries: BTreeMap<String, serde_json::Value>,
    ) -> (Self, Vec<(String, ValidationError)>) {
        let mut catalog = Self::new();
        let mut rejected = Vec::new();

        for (name, value) in entries {
            let spec = match serde_json::from_value::<ProfileSpec>(value) {
                Ok(mut spec) => {
                    spec.name = name.clone();
                    spec
                }
                Err(e) => {
                    warn!(profile = %name, error = %e, "Rejected malformed profile entry");
                    rejected.push((name, ValidationError::Malformed(e.to_string())));
                    continue;
                }
            };
            match validate(spec) {
                Ok(profile) => catalog.insert(profile),
                Err(e) => {
                    warn!(profile = %name, error = %e, "Rejected invalid profile");
                    rejected.push((name, e));
                }
            }
        }

        (catalog, rejected)
    }

    pub fn insert(&mut self, profile: Profile) {
        self.profiles
            .insert(profile.name().to_string(), Arc::new(profile));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Profile>, CatalogError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))
    }

    /// Profile names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn spec(name: &str) -> ProfileSpec {
        ProfileSpec {
            name: name.to_string(),
            protocol_mix: BTreeMap::from([(Protocol::Tcp, 0.7), (Protocol::Udp, 0.3)]),
            target_rate_per_second: 50.0,
            burstiness: 0.2,
            payload_size_range: (64, 1500),
            anomaly_rate: 0.1,
            count: Some(1000),
            duration_secs: None,
            ports: default_ports(),
            mutators: None,
        }
    }

    #[test]
    fn test_valid_profile() {
        let profile = validate(spec("baseline")).unwrap();
        assert_eq!(profile.name(), "baseline");
        assert_eq!(profile.limit(), RunLimit::Count(1000));
        assert_eq!(profile.mutators().len(), 4);
        assert_eq!(profile.nominal_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_weight_sum_tolerance() {
        let mut s = spec("p");
        s.protocol_mix = BTreeMap::from([(Protocol::Tcp, 0.7), (Protocol::Udp, 0.3 + 5e-7)]);
        assert!(validate(s.clone()).is_ok());

        s.protocol_mix = BTreeMap::from([(Protocol::Tcp, 0.7), (Protocol::Udp, 0.31)]);
        assert!(matches!(validate(s), Err(ValidationError::WeightSum { .. })));
    }

    #[test]
    fn test_rejections() {
        let mut s = spec("p");
        s.target_rate_per_second = 0.0;
        assert_eq!(validate(s).unwrap_err(), ValidationError::NonPositiveRate(0.0));

        let mut s = spec("p");
        s.payload_size_range = (1500, 64);
        assert!(matches!(
            validate(s),
            Err(ValidationError::InvertedPayloadRange { .. })
        ));

        let mut s = spec("p");
        s.duration_secs = Some(10.0);
        assert_eq!(validate(s).unwrap_err(), ValidationError::RunLimitAmbiguous);

        let mut s = spec("p");
        s.count = None;
        assert_eq!(validate(s).unwrap_err(), ValidationError::RunLimitAmbiguous);

        let mut s = spec("p");
        s.anomaly_rate = 1.5;
        assert!(matches!(
            validate(s),
            Err(ValidationError::AnomalyRateOutOfRange(_))
        ));

        let mut s = spec("p");
        s.burstiness = -0.1;
        assert!(matches!(
            validate(s),
            Err(ValidationError::BurstinessOutOfRange(_))
        ));

        for burstiness in [1e308, f64::INFINITY, f64::NAN] {
            let mut s = spec("p");
            s.burstiness = burstiness;
            assert!(matches!(
                validate(s),
                Err(ValidationError::BurstinessOutOfRange(_))
            ));
        }

        let mut s = spec("p");
        s.ports = vec![80, 0];
        assert_eq!(validate(s).unwrap_err(), ValidationError::InvalidPort(0));

        let mut s = spec("p");
        s.mutators = Some(vec![]);
        assert_eq!(validate(s).unwrap_err(), ValidationError::EmptyMutators);
    }

    #[test]
    fn test_weight_table_pick() {
        let profile = validate(spec("p")).unwrap();
        let table = profile.weights();
        assert_eq!(table.pick(0.0), Protocol::Tcp);
        assert_eq!(table.pick(0.69), Protocol::Tcp);
        assert_eq!(table.pick(0.71), Protocol::Udp);
        assert_eq!(table.pick(0.999_999), Protocol::Udp);
    }

    #[test]
    fn test_zero_weight_never_picked() {
        let mut s = spec("p");
        s.protocol_mix = BTreeMap::from([
            (Protocol::Tcp, 0.5),
            (Protocol::Icmp, 0.0),
            (Protocol::Https, 0.5),
        ]);
        let profile = validate(s).unwrap();
        let picked: Vec<Protocol> = profile.weights().protocols().collect();
        assert_eq!(picked, vec![Protocol::Tcp, Protocol::Https]);
    }

    #[test]
    fn test_catalog_rejects_individually() {
        let entries: BTreeMap<String, serde_json::Value> = BTreeMap::from([
            (
                "good".to_string(),
                serde_json::json!({
                    "protocolMix": {"TCP": 0.5, "icmp": 0.5},
                    "targetRatePerSecond": 10,
                    "payloadSizeRange": [0, 128],
                    "durationSecs": 5
                }),
            ),
            (
                "bad-sum".to_string(),
                serde_json::json!({
                    "protocolMix": {"TCP": 0.5},
                    "targetRatePerSecond": 10,
                    "payloadSizeRange": [0, 128],
                    "count": 5
                }),
            ),
            ("garbage".to_string(), serde_json::json!({"protocolMix": 7})),
        ]);

        let (catalog, rejected) = ProfileCatalog::from_entries(entries);
        assert_eq!(catalog.names(), vec!["good".to_string()]);
        assert_eq!(rejected.len(), 2);
        assert!(matches!(
            catalog.get("missing"),
            Err(CatalogError::NotFound(_))
        ));

        let good = catalog.get("good").unwrap();
        assert_eq!(good.limit(), RunLimit::Duration(Duration::from_secs(5)));
        assert_eq!(good.ports(), &DEFAULT_PORTS);
    }
}
