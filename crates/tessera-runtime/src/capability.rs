//! Engine selection and capability tiers.
//!
//! An engine string such as `NATIVE:BLOCKED,PLAIN` names an engine and,
//! optionally, the capability tiers it may use in preference order.
//! Building a native layout tries each tier in turn; a tier that cannot
//! serve the operator reports [`Error::CapabilityProbe`] and the next one is
//! tried.

use crate::error::{Result, RuntimeError};
use crate::layout::MemoryFormat;
use std::fmt;
use std::str::FromStr;
use tessera_core::Error;

/// One fallback option for building a native layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityTier {
    /// Channel-blocked layout (nChw8c).
    Blocked,
    /// Channels-innermost layout (NHWC).
    ChannelsLast,
    /// Plain layout in native precision.
    Plain,
}

impl CapabilityTier {
    /// Every tier in default preference order.
    pub const ALL: [CapabilityTier; 3] = [
        CapabilityTier::Blocked,
        CapabilityTier::ChannelsLast,
        CapabilityTier::Plain,
    ];

    pub fn format(&self) -> MemoryFormat {
        match self {
            CapabilityTier::Blocked => MemoryFormat::Blocked8,
            CapabilityTier::ChannelsLast => MemoryFormat::ChannelsLast,
            CapabilityTier::Plain => MemoryFormat::Plain,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CapabilityTier::Blocked => "BLOCKED",
            CapabilityTier::ChannelsLast => "CHANNELS_LAST",
            CapabilityTier::Plain => "PLAIN",
        }
    }
}

impl FromStr for CapabilityTier {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CapabilityTier::ALL
            .into_iter()
            .find(|tier| tier.name() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown sub-engine '{}'", s)))
    }
}

/// Compute engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    /// Canonical layout only.
    Reference,
    /// Native layouts chosen through capability tiers.
    Native,
}

/// A parsed engine string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    engine: Engine,
    tiers: Vec<CapabilityTier>,
}

impl EngineSpec {
    /// Parse `ENGINE` or `ENGINE:SUB1,SUB2`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for an unknown engine or sub-engine,
    /// a repeated sub-engine, or sub-engines on `REFERENCE`.
    pub fn parse(spec: &str) -> tessera_core::Result<Self> {
        let (name, subs) = match spec.split_once(':') {
            Some((name, subs)) => (name.trim(), Some(subs)),
            None => (spec.trim(), None),
        };

        let engine = match name {
            "REFERENCE" => Engine::Reference,
            "NATIVE" => Engine::Native,
            other => {
                return Err(Error::Configuration(format!("unknown engine '{}'", other)));
            }
        };

        let mut tiers = Vec::new();
        if let Some(subs) = subs {
            if engine == Engine::Reference {
                return Err(Error::Configuration(format!(
                    "engine REFERENCE takes no sub-engines, got '{}'",
                    spec
                )));
            }
            for sub in subs.split(',').map(str::trim) {
                let tier: CapabilityTier = sub.parse()?;
                if tiers.contains(&tier) {
                    return Err(Error::Configuration(format!(
                        "sub-engine '{}' listed twice in '{}'",
                        sub, spec
                    )));
                }
                tiers.push(tier);
            }
        } else if engine == Engine::Native {
            tiers = CapabilityTier::ALL.to_vec();
        }

        Ok(Self { engine, tiers })
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Tiers to try, in order. Empty for the reference engine.
    pub fn tiers(&self) -> &[CapabilityTier] {
        &self.tiers
    }

    pub fn is_reference(&self) -> bool {
        self.engine == Engine::Reference
    }
}

impl fmt::Display for EngineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.engine {
            Engine::Reference => write!(f, "REFERENCE"),
            Engine::Native => {
                let subs: Vec<&str> = self.tiers.iter().map(CapabilityTier::name).collect();
                write!(f, "NATIVE:{}", subs.join(","))
            }
        }
    }
}

/// Try `probe` on each tier in order and return the first success.
///
/// # Errors
///
/// A probe error other than `Error::CapabilityProbe` is returned as is.
/// If every tier fails, returns `RuntimeError::CapabilityExhausted` naming
/// `layer` and every tier's reason.
pub fn negotiate<T>(
    layer: &str,
    tiers: &[CapabilityTier],
    mut probe: impl FnMut(CapabilityTier) -> Result<T>,
) -> Result<(CapabilityTier, T)> {
    let mut reasons = Vec::new();
    for &tier in tiers {
        match probe(tier) {
            Ok(value) => {
                tracing::debug!(layer, tier = tier.name(), "capability tier selected");
                return Ok((tier, value));
            }
            Err(RuntimeError::Core(Error::CapabilityProbe(reason))) => {
                tracing::debug!(layer, tier = tier.name(), reason = %reason, "capability tier unavailable");
                reasons.push(format!("{}: {}", tier.name(), reason));
            }
            Err(other) => return Err(other),
        }
    }
    Err(RuntimeError::CapabilityExhausted {
        layer: layer.to_string(),
        reasons: if reasons.is_empty() {
            "no tiers enabled".to_string()
        } else {
            reasons.join("; ")
        },
    })
}

/// Shorthand for a probe failure.
pub fn unavailable<T>(reason: impl Into<String>) -> Result<T> {
    Err(Error::CapabilityProbe(reason.into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engines() {
        let native = EngineSpec::parse("NATIVE").unwrap();
        assert_eq!(native.tiers(), &CapabilityTier::ALL);

        let picked = EngineSpec::parse("NATIVE:PLAIN,BLOCKED").unwrap();
        assert_eq!(
            picked.tiers(),
            &[CapabilityTier::Plain, CapabilityTier::Blocked]
        );
        assert_eq!(picked.to_string(), "NATIVE:PLAIN,BLOCKED");

        let reference = EngineSpec::parse("REFERENCE").unwrap();
        assert!(reference.is_reference());
        assert!(reference.tiers().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["GPU", "NATIVE:FAST", "REFERENCE:PLAIN", "NATIVE:PLAIN,PLAIN"] {
            let err = EngineSpec::parse(bad).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{bad}");
        }
    }

    #[test]
    fn test_negotiate_falls_through_tiers() {
        let (tier, format) = negotiate("conv", &CapabilityTier::ALL, |tier| match tier {
            CapabilityTier::Blocked => unavailable("channels not divisible by 8"),
            other => Ok(other.format()),
        })
        .unwrap();
        assert_eq!(tier, CapabilityTier::ChannelsLast);
        assert_eq!(format, MemoryFormat::ChannelsLast);
    }

    #[test]
    fn test_negotiate_exhausted() {
        let err = negotiate::<()>("conv", &[CapabilityTier::Blocked], |_| unavailable("no"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CapabilityExhausted { .. }));
        assert!(err.to_string().contains("BLOCKED: no"));
    }

    #[test]
    fn test_negotiate_propagates_hard_errors() {
        let err = negotiate::<()>("conv", &CapabilityTier::ALL, |_| {
            Err(RuntimeError::DimensionError("bad".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeError::DimensionError(_)));
    }
}
