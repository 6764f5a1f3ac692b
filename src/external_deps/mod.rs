//! Integrations that rely on third-party services.
//!
//! This module groups adapters for captcha solving vendors that bridge the
//! challenge resolver with the outside world.

pub mod captcha;

pub use captcha::{CapMonsterProvider, CaptchaProvider, TwoCaptchaProvider};
