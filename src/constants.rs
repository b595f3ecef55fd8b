// ABOUTME: System-wide constants for the provider gateway
// ABOUTME: Contains pricing fallback rates, context planning defaults, and channel sizing
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Constants Module
//!
//! Hardcoded defaults shared across components. Runtime-tunable values live in
//! [`crate::config`]; everything here is either a protocol constant or a
//! last-resort default that must stay identical across deployments.

/// Pricing resolution and cost arithmetic constants
pub mod pricing {
    /// Universal fallback input rate in USD per 1K tokens, used when neither a
    /// stored override nor a driver default exists for a provider/model pair
    pub const UNIVERSAL_FALLBACK_INPUT_RATE: f64 = 0.001;

    /// Universal fallback output rate in USD per 1K tokens
    pub const UNIVERSAL_FALLBACK_OUTPUT_RATE: f64 = 0.002;

    /// Currency assigned to universal fallback descriptors
    pub const UNIVERSAL_FALLBACK_CURRENCY: &str = "USD";

    /// Decimal places monetary amounts are rounded to after each calculation
    pub const CURRENCY_DECIMAL_PLACES: i32 = 6;

    /// ISO 4217 codes accepted in pricing overrides
    pub const SUPPORTED_CURRENCIES: &[&str] = &["USD", "EUR", "GBP"];

    /// Tokens covered by one billing unit at per-1K granularity
    pub const TOKENS_PER_1K_UNIT: f64 = 1_000.0;

    /// Tokens covered by one billing unit at per-1M granularity
    pub const TOKENS_PER_1M_UNIT: f64 = 1_000_000.0;
}

/// Context preservation planning constants
pub mod context {
    /// Fraction of the target model's context window available to carried
    /// history; the remainder is head-room for the reply and tokenizer drift
    pub const DEFAULT_SAFETY_MARGIN: f64 = 0.9;

    /// Character-per-token ratio used when a provider reports no usage
    pub const FALLBACK_CHARS_PER_TOKEN: f64 = 4.0;

    /// Context window assumed for models missing from every driver catalog
    pub const DEFAULT_CONTEXT_WINDOW: u32 = 8_192;
}

/// Event bus and channel sizing
pub mod channels {
    /// Capacity of the broadcast channel behind the gateway event bus
    pub const EVENT_BUS_CAPACITY: usize = 256;
}

/// Limits applied to user-supplied values
pub mod limits {
    /// Maximum accepted length for a conversation title
    pub const MAX_TITLE_LENGTH: usize = 512;

    /// Maximum accepted length for a switch reason annotation
    pub const MAX_SWITCH_REASON_LENGTH: usize = 1_024;

    /// Maximum number of candidates honored in one fallback priority list
    pub const MAX_FALLBACK_CANDIDATES: usize = 16;
}
