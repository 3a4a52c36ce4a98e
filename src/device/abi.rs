//! Device ABI names

/// Binary interface a native artifact is compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Abi {
    Arm64V8a,
    ArmeabiV7a,
    Armeabi,
    X86_64,
    X86,
    Riscv64,
}

impl Abi {
    /// Parse the name used by `ro.product.cpu.abilist`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "arm64-v8a" => Some(Abi::Arm64V8a),
            "armeabi-v7a" => Some(Abi::ArmeabiV7a),
            "armeabi" => Some(Abi::Armeabi),
            "x86_64" => Some(Abi::X86_64),
            "x86" => Some(Abi::X86),
            "riscv64" => Some(Abi::Riscv64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "arm64-v8a",
            Abi::ArmeabiV7a => "armeabi-v7a",
            Abi::Armeabi => "armeabi",
            Abi::X86_64 => "x86_64",
            Abi::X86 => "x86",
            Abi::Riscv64 => "riscv64",
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Abi::Arm64V8a | Abi::X86_64 | Abi::Riscv64 => 64,
            Abi::ArmeabiV7a | Abi::Armeabi | Abi::X86 => 32,
        }
    }

    /// Architecture suffix of frida release assets, if frida ships one.
    pub fn frida_arch(&self) -> Option<&'static str> {
        match self {
            Abi::Arm64V8a => Some("arm64"),
            Abi::ArmeabiV7a | Abi::Armeabi => Some("arm"),
            Abi::X86_64 => Some("x86_64"),
            Abi::X86 => Some("x86"),
            Abi::Riscv64 => None,
        }
    }
}
