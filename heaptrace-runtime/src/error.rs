use thiserror::Error;

/// All failure modes of the remote-variable layer and the snapshot bridge built on top of it.
///
/// Low-level accessor failures are never swallowed: they propagate unchanged to whoever
/// issued the operation, and no layer in between retries.
#[derive(Debug, Error)]
pub enum Error {
    /// A variable was used before its address was known or computable
    #[error("variable has no resolved address")]
    UnresolvedAddress,

    /// A named symbol could not be found in the target, e.g. because the
    /// instrumentation library is not currently loaded
    #[error("symbol `{symbol}` not found{}", module_suffix(.module))]
    SymbolNotFound {
        symbol: String,
        module: Option<String>,
    },

    /// A read or write touched memory the target does not have mapped
    #[error("memory access fault at {address:#x} ({length} bytes)")]
    MemoryAccessFault { address: u64, length: usize },

    /// No target process is running, or the instrumentation library is absent from it
    #[error("target not loaded: {0}")]
    NotLoaded(String),

    /// A type description or supplied value does not fit the declared layout
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}

fn module_suffix(module: &Option<String>) -> String {
    match module {
        Some(module) => format!(" in module `{module}`"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn symbol_not_found(symbol: &str, module: Option<&str>) -> Error {
        Error::SymbolNotFound {
            symbol: symbol.to_string(),
            module: module.map(|module| module.to_string()),
        }
    }
}
