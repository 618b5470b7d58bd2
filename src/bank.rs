//! In-memory account store.
//!
//! The server dispatches every operation into this module. Failures are
//! checked in a fixed priority order: existence, then authentication, then
//! currency, then argument sanity, then funds. The store is not thread-safe;
//! the single-threaded server loop runs at most one operation at a time.
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::proto::{Currency, Status, PASSWORD_LEN};

/// First account number handed out; numbers are assigned sequentially and
/// never reused.
pub const FIRST_ACCOUNT_NO: i32 = 10001;

/// Typed failure of a bank operation, one per reply status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankError {
    NotFound,
    Auth,
    WrongCurrency,
    BadRequest,
    PasswordFormat,
    InsufficientFunds,
}

impl From<BankError> for Status {
    fn from(err: BankError) -> Status {
        match err {
            BankError::NotFound => Status::ERR_NOT_FOUND,
            BankError::Auth => Status::ERR_AUTH,
            BankError::WrongCurrency => Status::ERR_CURRENCY,
            BankError::BadRequest => Status::ERR_BAD_REQUEST,
            BankError::PasswordFormat => Status::ERR_PASSWORD_FORMAT,
            BankError::InsufficientFunds => Status::ERR_INSUFFICIENT_FUNDS,
        }
    }
}

impl fmt::Display for BankError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BankError::NotFound => write!(f, "no such account"),
            BankError::Auth => write!(f, "name or password mismatch"),
            BankError::WrongCurrency => write!(f, "currency mismatch"),
            BankError::BadRequest => write!(f, "malformed operation arguments"),
            BankError::PasswordFormat => write!(f, "password must be 1..=16 bytes"),
            BankError::InsufficientFunds => write!(f, "insufficient funds"),
        }
    }
}

impl Error for BankError {}

/// A single account. `closed` is monotonic: once set it never clears, and a
/// closed account behaves as not-found for every operation.
#[derive(Debug, Clone)]
pub struct Account {
    pub account_no: i32,
    pub name: String,
    password: String,
    pub currency: Currency,
    pub balance: f64,
    closed: bool,
}

/// The account store. Owned by the server process; state vanishes on restart.
#[derive(Debug)]
pub struct Bank {
    accounts: HashMap<i32, Account>,
    next_account_no: i32,
}

impl Default for Bank {
    fn default() -> Self {
        Self::new()
    }
}

impl Bank {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            next_account_no: FIRST_ACCOUNT_NO,
        }
    }

    /// Open a new account and return its number and starting balance.
    pub fn open(
        &mut self,
        name: &str,
        password: &str,
        currency: Currency,
        initial: f64,
    ) -> Result<(i32, f64), BankError> {
        if password.is_empty() || password.len() > PASSWORD_LEN {
            return Err(BankError::PasswordFormat);
        }
        if name.is_empty() || initial < 0.0 || !initial.is_finite() {
            return Err(BankError::BadRequest);
        }
        let account_no = self.next_account_no;
        self.next_account_no += 1;
        self.accounts.insert(
            account_no,
            Account {
                account_no,
                name: name.to_string(),
                password: password.to_string(),
                currency,
                balance: initial,
                closed: false,
            },
        );
        Ok((account_no, initial))
    }

    /// Close an account and return a snapshot of its final state, taken after
    /// the account is marked closed.
    pub fn close(
        &mut self,
        name: &str,
        account_no: i32,
        password: &str,
    ) -> Result<Account, BankError> {
        self.authenticated(name, account_no, password)?;
        let account = self.account_mut(account_no)?;
        account.closed = true;
        Ok(account.clone())
    }

    /// Add `amount` to the account and return the new balance.
    pub fn deposit(
        &mut self,
        name: &str,
        account_no: i32,
        password: &str,
        currency: Currency,
        amount: f64,
    ) -> Result<f64, BankError> {
        let account = self.authenticated(name, account_no, password)?;
        if account.currency != currency {
            return Err(BankError::WrongCurrency);
        }
        if amount <= 0.0 || !amount.is_finite() {
            return Err(BankError::BadRequest);
        }
        let account = self.account_mut(account_no)?;
        account.balance += amount;
        Ok(account.balance)
    }

    /// Remove `amount` from the account and return the new balance.
    pub fn withdraw(
        &mut self,
        name: &str,
        account_no: i32,
        password: &str,
        currency: Currency,
        amount: f64,
    ) -> Result<f64, BankError> {
        let account = self.authenticated(name, account_no, password)?;
        if account.currency != currency {
            return Err(BankError::WrongCurrency);
        }
        if amount <= 0.0 || !amount.is_finite() {
            return Err(BankError::BadRequest);
        }
        if account.balance < amount {
            return Err(BankError::InsufficientFunds);
        }
        let account = self.account_mut(account_no)?;
        account.balance -= amount;
        Ok(account.balance)
    }

    /// Report the account's currency and balance.
    pub fn query(
        &self,
        name: &str,
        account_no: i32,
        password: &str,
    ) -> Result<(Currency, f64), BankError> {
        let account = self.authenticated(name, account_no, password)?;
        Ok((account.currency, account.balance))
    }

    /// Move `amount` between two accounts atomically: every check runs before
    /// either balance changes, so a failure leaves both untouched. Returns the
    /// new (from, to) balances.
    pub fn transfer(
        &mut self,
        name: &str,
        from_account: i32,
        password: &str,
        to_account: i32,
        currency: Currency,
        amount: f64,
    ) -> Result<(f64, f64), BankError> {
        let from = self.authenticated(name, from_account, password)?;
        let to = self.account(to_account)?;
        if from.currency != currency || to.currency != currency {
            return Err(BankError::WrongCurrency);
        }
        if from_account == to_account {
            return Err(BankError::BadRequest);
        }
        if amount <= 0.0 || !amount.is_finite() {
            return Err(BankError::BadRequest);
        }
        if from.balance < amount {
            return Err(BankError::InsufficientFunds);
        }
        let from = self.account_mut(from_account)?;
        from.balance -= amount;
        let from_balance = from.balance;
        let to = self.account_mut(to_account)?;
        to.balance += amount;
        Ok((from_balance, to.balance))
    }

    fn account(&self, account_no: i32) -> Result<&Account, BankError> {
        self.accounts
            .get(&account_no)
            .filter(|a| !a.closed)
            .ok_or(BankError::NotFound)
    }

    fn account_mut(&mut self, account_no: i32) -> Result<&mut Account, BankError> {
        self.accounts
            .get_mut(&account_no)
            .filter(|a| !a.closed)
            .ok_or(BankError::NotFound)
    }

    /// Look up an open account and verify the caller's credentials.
    /// Existence is checked before authentication, so a missing account is
    /// NotFound even when the credentials would also be wrong.
    fn authenticated(
        &self,
        name: &str,
        account_no: i32,
        password: &str,
    ) -> Result<&Account, BankError> {
        let account = self.account(account_no)?;
        if account.name != name || account.password != password {
            return Err(BankError::Auth);
        }
        Ok(account)
    }
}
