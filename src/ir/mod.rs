pub mod parser;
pub mod scanner;
pub mod token;

/// One parsed compilation unit. Functions and globals carry an optional
/// placement unit name, filled in by the isolation pass before codegen.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub externs: Vec<String>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn defines(&self, name: &str) -> bool {
        self.function(name).is_some() || self.global(name).is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Inst>,
    /// Placement unit name, e.g. `.text.add2`. Set by the isolation pass.
    pub placement: Option<String>,
}

impl Function {
    /// Names this function needs resolved at link time: call targets and
    /// `addr` operands.
    pub fn references(&self) -> Vec<&str> {
        let mut refs = vec![];
        for inst in &self.body {
            match inst {
                Inst::Call { callee, .. } => refs.push(callee.as_str()),
                Inst::Addr { global, .. } => refs.push(global.as_str()),
                _ => (),
            }
        }
        refs
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub init: GlobalInit,
    pub read_only: bool,
    pub placement: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GlobalInit {
    /// Byte string, stored verbatim.
    Bytes(Vec<u8>),
    /// One 8-byte little-endian word.
    Word(u64),
}

impl GlobalInit {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            GlobalInit::Bytes(b) => b.clone(),
            GlobalInit::Word(w) => w.to_le_bytes().to_vec(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            GlobalInit::Bytes(b) => b.len(),
            GlobalInit::Word(_) => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Value(String),
    Literal(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Copy {
        dst: String,
        src: Operand,
    },
    Bin {
        op: BinOp,
        dst: String,
        lhs: Operand,
        rhs: Operand,
    },
    /// Target address of a module global, as an absolute 64-bit value.
    Addr {
        dst: String,
        global: String,
    },
    Call {
        dst: String,
        callee: String,
        args: Vec<Operand>,
    },
    Ret {
        value: Operand,
    },
}
