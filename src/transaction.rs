//! Nested transaction bookkeeping.
//!
//! Only the outermost frame maps onto an engine transaction. Inner frames just
//! record whether they completed successfully; a failed inner frame forces the
//! outermost one to roll back.

use crate::error::{Error, Result};

/// How the outermost transaction takes its locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionMode {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TransactionMode::Deferred => "BEGIN;",
            TransactionMode::Immediate => "BEGIN IMMEDIATE;",
            TransactionMode::Exclusive => "BEGIN EXCLUSIVE;",
        }
    }

    /// Mode requested by raw `BEGIN [DEFERRED|IMMEDIATE|EXCLUSIVE] ...` text.
    pub(crate) fn from_begin_sql(sql: &str) -> Self {
        let mode = sql
            .split(|c: char| c.is_whitespace() || c == ';')
            .filter(|word| !word.is_empty())
            .nth(1)
            .map(str::to_ascii_uppercase);
        match mode.as_deref() {
            Some("IMMEDIATE") => TransactionMode::Immediate,
            Some("EXCLUSIVE") => TransactionMode::Exclusive,
            _ => TransactionMode::Deferred,
        }
    }
}

/// What the engine must do after a frame ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// An inner frame ended; the engine transaction stays open.
    NoAction,
    Commit,
    Rollback,
}

impl TransactionOutcome {
    pub(crate) fn sql(self) -> Option<&'static str> {
        match self {
            TransactionOutcome::NoAction => None,
            TransactionOutcome::Commit => Some("COMMIT;"),
            TransactionOutcome::Rollback => Some("ROLLBACK;"),
        }
    }
}

#[derive(Debug, Default)]
struct TransactionFrame {
    mode: TransactionMode,
    marked_successful: bool,
    child_failed: bool,
}

const NO_TRANSACTION: &str =
    "Cannot perform this operation because there is no current transaction.";
const ALREADY_SUCCESSFUL: &str = "Cannot perform this operation because the transaction has \
     already been marked successful. The only thing you can do now is end the transaction.";

/// Stack of open transaction frames for one connection.
#[derive(Debug, Default)]
pub struct TransactionManager {
    stack: Vec<TransactionFrame>,
    free: Vec<TransactionFrame>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a frame. Returns `true` when it is the outermost one and the
    /// caller must issue the engine-level BEGIN.
    pub fn begin_transaction(&mut self, mode: TransactionMode) -> Result<bool> {
        if self.stack.last().is_some_and(|frame| frame.marked_successful) {
            return Err(Error::misuse(ALREADY_SUCCESSFUL));
        }
        let outermost = self.stack.is_empty();
        let mut frame = self.free.pop().unwrap_or_default();
        frame.mode = mode;
        frame.marked_successful = false;
        frame.child_failed = false;
        self.stack.push(frame);
        Ok(outermost)
    }

    /// Pops a just-pushed outermost frame whose engine BEGIN failed.
    pub fn cancel_transaction(&mut self) -> Result<()> {
        match self.stack.len() {
            0 => Err(Error::misuse(NO_TRANSACTION)),
            1 => {
                self.recycle_top();
                Ok(())
            }
            _ => Err(Error::misuse(
                "Cannot cancel a nested transaction; only the outermost one may be cancelled.",
            )),
        }
    }

    pub fn set_transaction_successful(&mut self) -> Result<()> {
        let frame = self
            .stack
            .last_mut()
            .ok_or_else(|| Error::misuse(NO_TRANSACTION))?;
        if frame.marked_successful {
            return Err(Error::misuse(ALREADY_SUCCESSFUL));
        }
        frame.marked_successful = true;
        Ok(())
    }

    /// Pops the top frame and reports what the engine has to do.
    pub fn end_transaction(&mut self) -> Result<TransactionOutcome> {
        let (successful, child_failed) = match self.stack.last() {
            Some(frame) => (frame.marked_successful, frame.child_failed),
            None => return Err(Error::misuse(NO_TRANSACTION)),
        };
        let committed = successful && !child_failed;
        self.recycle_top();

        match self.stack.last_mut() {
            Some(parent) => {
                if !committed {
                    parent.child_failed = true;
                }
                Ok(TransactionOutcome::NoAction)
            }
            None if committed => Ok(TransactionOutcome::Commit),
            None => Ok(TransactionOutcome::Rollback),
        }
    }

    pub fn has_transaction(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Mode of the outermost frame, if any.
    pub fn outermost_mode(&self) -> Option<TransactionMode> {
        self.stack.first().map(|frame| frame.mode)
    }

    fn recycle_top(&mut self) {
        if let Some(frame) = self.stack.pop() {
            self.free.push(frame);
        }
    }
}
