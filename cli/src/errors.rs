use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] vsistore_storage::Error),

    /// Accessing a data item failed, `item` is the item as it was asked for.
    #[error("could not access dataset {item}: {source}")]
    Dataset {
        item: String,
        source: vsistore_storage::Error,
    },

    #[error("no such {kind} with name {name:?}")]
    NoSuch { kind: &'static str, name: String },

    #[error("could not determine type for storage location {0:?}")]
    UndetectedType(String),

    #[error("no item location given after {0:?}")]
    MissingLocation(String),

    #[error("unable to write output: {0}")]
    Output(#[from] std::io::Error),
}
