use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not open storage backend")]
    Storage,
    #[display("file store error")]
    Vault,
    #[display("I/O error on {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// Some versions given to `prune` were not released.
    #[display("{_0} version(s) could not be pruned")]
    Incomplete(#[error(not(source))] usize),
}
