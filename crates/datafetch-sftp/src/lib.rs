// datafetch-sftp - SFTP side of the data-acquisition engine
//
// Session pools with the same gate/rate/retry discipline as the HTTP
// manager, a russh-backed transport behind a narrow session trait (tests run
// against an in-memory fake server), directory and per-file bundle locators
// with durable progress markers, and a streaming loader.

pub mod config;
pub mod loader;
pub mod locators;
pub mod manager;
pub mod strategies;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SftpProtocolConfig;
pub use loader::SftpBundleLoader;
pub use locators::{DirectorySftpBundleLocator, FileSftpBundleLocator};
pub use manager::SftpManager;
pub use strategies::{
    DateFilenameFilter, FileSortStrategy, FilenameFilter, LexicographicalSort, ModifiedTimeSort,
};
pub use transport::{RusshConnector, SftpConnector, SftpCredentials, SftpFileStat, SftpSessionOps};
