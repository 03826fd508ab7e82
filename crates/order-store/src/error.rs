use thiserror::Error;

use crate::OrderUid;

/// The sub-write of a save transaction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveStage {
    /// Opening the transaction.
    Begin,
    /// Inserting (or reading back) the root order row.
    Root,
    /// Writing the delivery row.
    Delivery,
    /// Writing the payment row.
    Payment,
    /// Replacing the item rows.
    Item,
    /// Committing the transaction.
    Commit,
}

impl SaveStage {
    /// Stage name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveStage::Begin => "begin",
            SaveStage::Root => "root",
            SaveStage::Delivery => "delivery",
            SaveStage::Payment => "payment",
            SaveStage::Item => "item",
            SaveStage::Commit => "commit",
        }
    }
}

impl std::fmt::Display for SaveStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur when interacting with the order store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A save transaction failed and was rolled back.
    #[error("Failed to save order {order_uid} at {stage} stage: {source}")]
    Save {
        order_uid: OrderUid,
        stage: SaveStage,
        #[source]
        source: sqlx::Error,
    },

    /// A save was refused by the store without reaching the database.
    #[error("Save of order {order_uid} rejected at {stage} stage: {reason}")]
    Rejected {
        order_uid: OrderUid,
        stage: SaveStage,
        reason: String,
    },

    /// The store could not serve the request at all.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Returns the failing save stage, if this error came from a save.
    pub fn stage(&self) -> Option<SaveStage> {
        match self {
            StoreError::Save { stage, .. } | StoreError::Rejected { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type for order store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
