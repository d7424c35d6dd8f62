//! Compound device identifiers.
//!
//! A device identifier glues the owning controller's key and the channel digit
//! together: `identifier = key * 10 + channel`. Routing a request back to its
//! controller is then plain integer division, no lookup table required.
//!
//! Families that expose exactly one device per configuration (the virtual stages)
//! use the configuration ID itself as identifier; [`Addressing::Direct`] covers that
//! case so callers can treat both schemes uniformly.

use crate::error::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Identifier of a device, unique across the whole fleet.
pub type Identifier = i64;

/// Identifier of a configuration (controller serial number or virtual stage ID).
pub type ConfigurationId = i64;

/// Identifier attached to an `UpdateResponse` whose item could not even be parsed.
pub const UNPARSED_IDENTIFIER: Identifier = -1;

const CHANNEL_RADIX: i64 = 10;

/// A decoded identifier: owning controller key plus channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompoundId {
    /// Owning controller
    pub key: ConfigurationId,
    /// One-based channel on it
    pub channel: u8,
}

impl fmt::Display for CompoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/ch{}", self.key, self.channel)
    }
}

/// How a family maps (key, channel) pairs onto fleet identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// `key * 10 + channel`, with `channel` restricted to `first..=last`.
    Compound { first: u8, last: u8 },
    /// The identifier is the key; every key has the single channel [`Addressing::DIRECT_CHANNEL`].
    Direct,
}

impl Addressing {
    /// The implicit channel of directly addressed devices.
    pub const DIRECT_CHANNEL: u8 = 1;

    /// Compound addressing over channels 1..=9.
    pub const fn one_based() -> Self {
        Addressing::Compound { first: 1, last: 9 }
    }

    /// Channels valid under this scheme.
    pub fn channels(&self) -> RangeInclusive<u8> {
        match *self {
            Addressing::Compound { first, last } => first..=last,
            Addressing::Direct => Self::DIRECT_CHANNEL..=Self::DIRECT_CHANNEL,
        }
    }

    /// Build the identifier for `channel` on controller `key`.
    pub fn encode(&self, key: ConfigurationId, channel: u8) -> FleetResult<Identifier> {
        if key < 0 {
            return Err(FleetError::Validation(format!(
                "controller key {key} must not be negative"
            )));
        }
        if !self.channels().contains(&channel) {
            return Err(FleetError::Validation(format!(
                "channel {channel} outside {:?} for controller {key}",
                self.channels()
            )));
        }
        match self {
            Addressing::Direct => Ok(key),
            Addressing::Compound { .. } => key
                .checked_mul(CHANNEL_RADIX)
                .and_then(|base| base.checked_add(i64::from(channel)))
                .ok_or_else(|| {
                    FleetError::Validation(format!("controller key {key} is too large"))
                }),
        }
    }

    /// Every identifier controller `key` can ever produce under this scheme.
    pub fn span(&self, key: ConfigurationId) -> RangeInclusive<Identifier> {
        match *self {
            Addressing::Direct => key..=key,
            Addressing::Compound { first, last } => {
                let base = key.saturating_mul(CHANNEL_RADIX);
                base.saturating_add(i64::from(first))..=base.saturating_add(i64::from(last))
            }
        }
    }

    /// Whether controller `key` under this scheme and `other_key` under `other` share a
    /// configuration key or could ever produce the same identifier.
    pub fn collides(&self, key: ConfigurationId, other: Addressing, other_key: ConfigurationId) -> bool {
        if key == other_key {
            return true;
        }
        let (a, b) = (self.span(key), other.span(other_key));
        a.start() <= b.end() && b.start() <= a.end()
    }

    /// Split an identifier into its controller key and channel.
    ///
    /// Fails loudly on identifiers whose channel digit is outside the family's range
    /// instead of routing them to a neighbouring controller.
    pub fn decode(&self, identifier: Identifier) -> FleetResult<CompoundId> {
        if identifier < 0 {
            return Err(FleetError::MalformedIdentifier {
                identifier,
                reason: "negative".to_string(),
            });
        }
        match self {
            Addressing::Direct => Ok(CompoundId {
                key: identifier,
                channel: Self::DIRECT_CHANNEL,
            }),
            Addressing::Compound { first, last } => {
                let digit = identifier % CHANNEL_RADIX;
                let channel = u8::try_from(digit).map_err(|_| FleetError::MalformedIdentifier {
                    identifier,
                    reason: format!("channel digit {digit} out of range"),
                })?;
                if channel < *first || channel > *last {
                    return Err(FleetError::MalformedIdentifier {
                        identifier,
                        reason: format!("channel {channel} outside {first}..={last}"),
                    });
                }
                Ok(CompoundId {
                    key: identifier / CHANNEL_RADIX,
                    channel,
                })
            }
        }
    }
}
