///! Symbol interning.
///!
///! Joy programs mention the same words constantly, so symbols live on the
///! stack as plain u32 ids and the table resolves them back to text. Each
///! distinct name is allocated once as an `Rc<str>` shared between the
///! id-ordered list and the lookup map; `name` is an index, `intern` a
///! single hash probe.

use std::collections::HashMap;
use std::rc::Rc;

/// An interned symbol id.
pub type Sym = u32;

pub struct SymbolTable {
    by_id: Vec<Rc<str>>,
    by_name: HashMap<Rc<str>, Sym>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            by_id: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Intern a symbol name, returning its id. Re-interning an existing
    /// name allocates nothing.
    pub fn intern(&mut self, name: &str) -> Sym {
        match self.by_name.get(name) {
            Some(&id) => id,
            None => {
                let id = self.by_id.len() as Sym;
                let shared: Rc<str> = Rc::from(name);
                self.by_id.push(shared.clone());
                self.by_name.insert(shared, id);
                id
            }
        }
    }

    /// The text of an interned symbol.
    pub fn name(&self, id: Sym) -> &str {
        &self.by_id[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut syms = SymbolTable::new();
        let a = syms.intern("dup");
        let b = syms.intern("dup");
        let c = syms.intern("swap");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(syms.name(a), "dup");
        assert_eq!(syms.name(c), "swap");
    }

    #[test]
    fn names_share_one_allocation() {
        let mut syms = SymbolTable::new();
        let id = syms.intern("genrec");
        // the map key and the id slot point at the same Rc'd text
        assert_eq!(Rc::strong_count(&syms.by_id[id as usize]), 2);
    }
}
