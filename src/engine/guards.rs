//! Request guards for deposits, withdrawals and bot activation.
//!
//! Guards are pure: they inspect an account snapshot and either return the
//! account as it should look after the action, or the first failed
//! precondition. Nothing is applied on failure.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::types::{
    Account, EngineError, PreconditionError, ValidationError, WithdrawalRequest,
};

/// Hex BLAKE3 digest of a credential, as stored on the account.
pub fn hash_credential(credential: &SecretString) -> String {
    blake3::hash(credential.expose_secret().as_bytes())
        .to_hex()
        .to_string()
}

/// Compare a supplied credential with a stored digest in constant time.
///
/// An unparseable stored digest never matches.
pub fn verify_credential(credential: &SecretString, stored_hash: &str) -> bool {
    match blake3::Hash::from_hex(stored_hash) {
        Ok(stored) => blake3::hash(credential.expose_secret().as_bytes()) == stored,
        Err(_) => false,
    }
}

/// Fees and floors applied by the guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPolicy {
    pub activation_fee: Decimal,
    pub min_withdrawal: Decimal,
    pub min_deposit: Decimal,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            activation_fee: dec!(5),
            min_withdrawal: dec!(10),
            min_deposit: Decimal::ZERO,
        }
    }
}

impl GuardPolicy {
    pub fn check_deposit(&self, amount: Decimal) -> Result<(), ValidationError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount));
        }
        if amount < self.min_deposit {
            return Err(ValidationError::BelowMinimumDeposit {
                amount,
                minimum: self.min_deposit,
            });
        }
        Ok(())
    }

    /// Charge the activation fee and switch the bot on.
    pub fn activate(&self, account: &Account) -> Result<Account, EngineError> {
        if account.bot_active {
            return Err(PreconditionError::BotAlreadyActive.into());
        }
        if account.balance < self.activation_fee {
            return Err(PreconditionError::InsufficientFunds {
                needed: self.activation_fee,
                available: account.balance,
            }
            .into());
        }

        let mut activated = account.clone();
        activated.balance -= self.activation_fee;
        activated.bot_active = true;
        debug!(account = %account.id, fee = %self.activation_fee, "Activation accepted");
        Ok(activated)
    }

    /// Validate a withdrawal and return the account with the amount deducted.
    ///
    /// Checks run in order: amount, floor, address, credential, funds.
    pub fn withdraw(
        &self,
        account: &Account,
        request: &WithdrawalRequest,
    ) -> Result<Account, EngineError> {
        let amount = request.amount;
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount).into());
        }
        if amount < self.min_withdrawal {
            return Err(ValidationError::BelowMinimumWithdrawal {
                amount,
                minimum: self.min_withdrawal,
            }
            .into());
        }
        if request.address.trim().is_empty() {
            return Err(ValidationError::EmptyAddress.into());
        }
        // Credential before funds: a rejected caller must not learn the balance.
        if !verify_credential(&request.credential, &account.credential_hash) {
            return Err(PreconditionError::InvalidCredential.into());
        }
        if amount > account.balance {
            return Err(PreconditionError::InsufficientFunds {
                needed: amount,
                available: account.balance,
            }
            .into());
        }

        let mut debited = account.clone();
        debited.balance -= amount;
        Ok(debited)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
