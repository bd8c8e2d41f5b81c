//! Form parsing for the two mutations. Everything here runs before any chain
//! call is made.

use crate::error::ValidationError;
use alloy::primitives::{
    Address,
    U256,
};
use std::str::FromStr;

/// Raw text of the register-team form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterTeamForm {
    pub name: String,
    pub wallet: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterTeam {
    pub name: String,
    pub wallet: Address,
    pub password: String,
}

/// Raw text of the make-a-guess form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuessForm {
    pub team: String,
    pub guess: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MakeGuess {
    pub team: Address,
    pub guess: U256,
}

impl RegisterTeamForm {
    pub fn validate(&self) -> Result<RegisterTeam, ValidationError> {
        let wallet = parse_address(&self.wallet)?;
        let name = required("team name", &self.name)?;
        let password = required("password", &self.password)?;
        Ok(RegisterTeam {
            name: name.to_string(),
            wallet,
            password: password.to_string(),
        })
    }
}

impl GuessForm {
    pub fn validate(&self) -> Result<MakeGuess, ValidationError> {
        let team = parse_address(&self.team)?;
        let raw = required("guess", &self.guess)?;
        let guess = parse_guess(raw)?;
        Ok(MakeGuess { team, guess })
    }
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    Ok(trimmed)
}

/// Accepts `0x` followed by 40 hex digits. Mixed-case input must carry a
/// valid EIP-55 checksum; all-lower or all-upper input is accepted as is.
pub fn parse_address(raw: &str) -> Result<Address, ValidationError> {
    let value = raw.trim();
    let invalid = || ValidationError::InvalidAddress {
        value: raw.to_string(),
    };
    let Some(digits) = value.strip_prefix("0x") else {
        return Err(invalid());
    };
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        Address::parse_checksummed(value, None).map_err(|_| invalid())
    } else {
        Address::from_str(value).map_err(|_| invalid())
    }
}

fn parse_guess(raw: &str) -> Result<U256, ValidationError> {
    if !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidGuess {
            value: raw.to_string(),
        });
    }
    U256::from_str_radix(raw, 10).map_err(|_| ValidationError::InvalidGuess {
        value: raw.to_string(),
    })
}
