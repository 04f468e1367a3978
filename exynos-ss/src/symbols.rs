//! Address to symbol resolution for function-pointer fields.

use std::fs;
use std::path::Path;

use crate::error::Result;

pub trait SymbolResolver: Send + Sync {
    /// Symbol name and offset into it, if `addr` falls in a known symbol.
    fn resolve(&self, addr: u64) -> Option<(&str, u64)>;

    /// `name`, `name+0xoff`, or the raw address when unresolved.
    fn render(&self, addr: u64) -> String {
        match self.resolve(addr) {
            Some((name, 0)) => name.to_string(),
            Some((name, off)) => format!("{name}+{off:#x}"),
            None => format!("{addr:#018x}"),
        }
    }
}

/// Resolves nothing; every address prints as hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _addr: u64) -> Option<(&str, u64)> {
        None
    }
}

/// Sorted symbol table, typically from a `System.map`.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: Vec<(u64, String)>,
}

impl SymbolTable {
    pub fn new(mut symbols: Vec<(u64, String)>) -> Self {
        symbols.sort_by_key(|(addr, _)| *addr);
        symbols.dedup_by_key(|(addr, _)| *addr);
        Self { symbols }
    }

    /// Parse `System.map` lines (`ffffff8008080000 T _text`). Malformed lines
    /// and non-text symbol types are skipped.
    pub fn from_system_map(text: &str) -> Self {
        let symbols = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
                let kind = parts.next()?;
                let name = parts.next()?;
                matches!(kind, "T" | "t" | "W" | "w").then(|| (addr, name.to_string()))
            })
            .collect();
        Self::new(symbols)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_system_map(&fs::read_to_string(path)?))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, addr: u64) -> Option<(&str, u64)> {
        let pos = self.symbols.partition_point(|(a, _)| *a <= addr);
        let (start, name) = self.symbols.get(pos.checked_sub(1)?)?;
        Some((name.as_str(), addr - start))
    }
}
