use tracing::debug;

use crate::error::Result;
use crate::ir::{BinOp, Inst, Module, Operand};

/// A module-level rewrite. The pipeline runs every pass once, in order,
/// before any code is generated.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, module: &mut Module) -> Result<()>;
}

pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> Self {
        PassManager { passes: vec![] }
    }

    /// Optimizations followed by the isolation transform, mirroring the
    /// optimize → isolate ordering of the build pipeline.
    pub fn default_pipeline() -> Self {
        let mut pm = PassManager::new();
        pm.add(ConstFold);
        pm.add(IsolatePlacement);
        pm
    }

    pub fn add(&mut self, pass: impl Pass + 'static) {
        self.passes.push(Box::new(pass));
    }

    pub fn run(&self, module: &mut Module) -> Result<()> {
        for pass in &self.passes {
            debug!(pass = pass.name(), "running pass");
            pass.run(module)?;
        }
        Ok(())
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds binary instructions whose operands are both literals.
pub struct ConstFold;

impl Pass for ConstFold {
    fn name(&self) -> &'static str {
        "const-fold"
    }

    fn run(&self, module: &mut Module) -> Result<()> {
        for func in &mut module.functions {
            for inst in &mut func.body {
                let Inst::Bin { op, dst, lhs, rhs } = inst else {
                    continue;
                };
                let (Operand::Literal(a), Operand::Literal(b)) = (&lhs, &rhs) else {
                    continue;
                };
                let folded = match op {
                    BinOp::Add => a.wrapping_add(*b),
                    BinOp::Sub => a.wrapping_sub(*b),
                    BinOp::Mul => a.wrapping_mul(*b),
                };
                *inst = Inst::Copy {
                    dst: dst.clone(),
                    src: Operand::Literal(folded),
                };
            }
        }
        Ok(())
    }
}

/// Function Isolation Transform: gives every function and global its own
/// placement unit so each one can be placed at an independent target
/// address. Names derive from the (unique) symbol names, and alignment is
/// implicitly 1 because the section allocator adds no padding.
pub struct IsolatePlacement;

impl Pass for IsolatePlacement {
    fn name(&self) -> &'static str {
        "isolate-placement"
    }

    fn run(&self, module: &mut Module) -> Result<()> {
        for func in &mut module.functions {
            func.placement = Some(format!(".text.{}", func.name));
        }
        for global in &mut module.globals {
            let prefix = if global.read_only { ".rodata" } else { ".data" };
            global.placement = Some(format!("{}.{}", prefix, global.name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse;

    #[test]
    fn test_const_fold() {
        let mut module = parse("func f() {\n t = add 2, 3\n ret t\n}\n").unwrap();
        ConstFold.run(&mut module).unwrap();
        assert_eq!(
            module.functions[0].body[0],
            Inst::Copy {
                dst: "t".to_string(),
                src: Operand::Literal(5),
            }
        );
    }

    #[test]
    fn test_const_fold_leaves_non_literals() {
        let mut module = parse("func f(a) {\n t = add a, 3\n ret t\n}\n").unwrap();
        ConstFold.run(&mut module).unwrap();
        assert!(matches!(module.functions[0].body[0], Inst::Bin { .. }));
    }

    #[test]
    fn test_isolation_names_are_unique() {
        let src = "rodata msg = \"x\"\ndata ctr = 0\nfunc f() {\n ret 0\n}\nfunc g() {\n ret 1\n}\n";
        let mut module = parse(src).unwrap();
        IsolatePlacement.run(&mut module).unwrap();

        let mut placements: Vec<String> = module
            .functions
            .iter()
            .map(|f| f.placement.clone().unwrap())
            .chain(module.globals.iter().map(|g| g.placement.clone().unwrap()))
            .collect();
        assert_eq!(placements.len(), 4);
        placements.sort();
        placements.dedup();
        assert_eq!(placements.len(), 4);
        assert!(placements.contains(&".text.f".to_string()));
        assert!(placements.contains(&".rodata.msg".to_string()));
        assert!(placements.contains(&".data.ctr".to_string()));
    }
}
