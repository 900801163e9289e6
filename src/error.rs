use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid signature token '{token}' at position {position}")]
    InvalidSignatureToken { token: String, position: usize },

    #[error("Signature pattern is empty")]
    EmptySignature,

    #[error("Invalid PE header: {0}")]
    InvalidPeHeader(&'static str),

    #[error("Module memory {base:#x}..{end:#x} is not readable")]
    ModuleNotReadable { base: usize, end: usize },

    #[error("Invalid hook address {0:#x}")]
    InvalidAddress(usize),

    #[error("Address {0:#x} is already hooked")]
    AlreadyHooked(usize),

    #[error("Hook at {address:#x} would overlap the hook at {existing:#x}")]
    OverlappingHook { address: usize, existing: usize },

    #[error("Instructions at {address:#x} span only {available} bytes, {required} needed")]
    InstructionTooShort { address: usize, available: usize, required: usize },

    #[error("Cannot decode instruction at {0:#x}")]
    UndecodableInstruction(usize),

    #[error("Cannot relocate instruction {opcode:#04x} at {address:#x}")]
    UnrelocatableInstruction { address: usize, opcode: u8 },

    #[error("Branch at {address:#x} targets {target:#x} inside the patched window")]
    BranchIntoPatch { address: usize, target: usize },

    #[error("Failed to allocate {0} bytes of executable memory")]
    AllocationFailed(usize),

    #[error("A thread is executing inside the patched window at {0:#x}")]
    ThreadInPatch(usize),

    #[error("No hook is installed at {0:#x}")]
    NotHooked(usize),

    #[error("Configuration value {field} is invalid: {message}")]
    InvalidConfig { field: &'static str, message: String },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("OS error: {0}")]
    Os(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the last Win32 error wrapped as `Error::Os`.
    pub fn last_os_error() -> Error {
        Error::Os(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages_carry_addresses() {
        let err = Error::OverlappingHook { address: 0x401002, existing: 0x401000 };
        assert_eq!(err.to_string(), "Hook at 0x401002 would overlap the hook at 0x401000");
    }
}
