// ===============================
// src/symbols.rs
// ===============================
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec { pub dollars_per_point: f64, pub commission_per_contract: f64 }

/// Per-symbol contract economics. Lookups never fail.
pub trait SymbolMetadata: Send + Sync {
    fn dollars_per_point(&self, symbol: &str) -> f64;
    fn commission_per_contract(&self, symbol: &str) -> f64;
}

/// Prefix table, longest prefix first, with a fallback for unknown roots.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    entries: Vec<(String, ContractSpec)>,
    fallback: ContractSpec,
}

impl SymbolTable {
    pub fn new<I, S>(entries: I, fallback: ContractSpec) -> Self
    where
        I: IntoIterator<Item = (S, ContractSpec)>,
        S: Into<String>,
    {
        let mut entries: Vec<(String, ContractSpec)> = entries
            .into_iter()
            .map(|(p, c)| {
                let p: String = p.into();
                (p.to_ascii_uppercase(), c)
            })
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries, fallback }
    }

    pub fn lookup(&self, symbol: &str) -> ContractSpec {
        let root = normalize(symbol);
        self.entries
            .iter()
            .find(|(prefix, _)| root.starts_with(prefix.as_str()))
            .map(|(_, spec)| *spec)
            .unwrap_or(self.fallback)
    }
}

// "/ESZ5", "F.US.ESZ5", "esz5" -> "ESZ5"
fn normalize(symbol: &str) -> String {
    let s = symbol.trim().to_ascii_uppercase();
    let s = s.strip_prefix("F.US.").unwrap_or(&s);
    s.trim_start_matches('/').to_string()
}

impl Default for SymbolTable {
    fn default() -> Self {
        let c = |dollars_per_point: f64, commission_per_contract: f64| ContractSpec { dollars_per_point, commission_per_contract };
        Self::new(
            [
                // equity index
                ("MES", c(5.0, 0.62)),
                ("ES", c(50.0, 2.25)),
                ("MNQ", c(2.0, 0.62)),
                ("NQ", c(20.0, 2.25)),
                ("MYM", c(0.5, 0.62)),
                ("YM", c(5.0, 2.25)),
                ("M2K", c(5.0, 0.62)),
                ("RTY", c(50.0, 2.25)),
                // energy / metals
                ("MCL", c(100.0, 0.72)),
                ("CL", c(1000.0, 2.35)),
                ("MGC", c(10.0, 0.72)),
                ("GC", c(100.0, 2.35)),
            ],
            c(1.0, 0.0),
        )
    }
}

impl SymbolMetadata for SymbolTable {
    fn dollars_per_point(&self, symbol: &str) -> f64 { self.lookup(symbol).dollars_per_point }
    fn commission_per_contract(&self, symbol: &str) -> f64 { self.lookup(symbol).commission_per_contract }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micro_wins_over_full_size() {
        let t = SymbolTable::default();
        assert_eq!(t.dollars_per_point("MESZ5"), 5.0);
        assert_eq!(t.dollars_per_point("ESZ5"), 50.0);
        assert_eq!(t.dollars_per_point("/NQH6"), 20.0);
        assert_eq!(t.dollars_per_point("F.US.MNQH6"), 2.0);
    }

    #[test]
    fn unknown_symbol_falls_back() {
        let t = SymbolTable::default();
        assert_eq!(t.dollars_per_point("ZZZ"), 1.0);
        assert_eq!(t.commission_per_contract(""), 0.0);
    }

    #[test]
    fn custom_table_sorted_by_prefix_length() {
        let spec = |d| ContractSpec { dollars_per_point: d, commission_per_contract: 0.0 };
        let t = SymbolTable::new([("A", spec(1.0)), ("AB", spec(2.0))], spec(9.0));
        assert_eq!(t.dollars_per_point("ABC"), 2.0);
        assert_eq!(t.dollars_per_point("AC"), 1.0);
        assert_eq!(t.dollars_per_point("X"), 9.0);
    }
}
