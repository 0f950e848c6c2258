use super::scanner::scan_line;
use super::token::Token;
use super::{BinOp, Function, Global, GlobalInit, Inst, Module, Operand};
use crate::error::{BuildError, Result};

/*
module := item*
item := global | extern | func
global := ("data" | "rodata") ident "=" (number | string)
extern := "extern" ident
func := "func" ident "(" params ")" "{" inst* "}"
params := (ident ("," ident)*)?
inst := copy | bin | addr | call | ret
copy := ident "=" operand
bin := ident "=" ("add" | "sub" | "mul") operand "," operand
addr := ident "=" "addr" ident
call := ident "=" "call" ident "(" (operand ("," operand)*)? ")"
ret := "ret" operand
operand := ident | number
*/

pub fn parse(source: &str) -> Result<Module> {
    let mut module = Module::default();
    let mut current: Option<Function> = None;

    for (i, line) in source.lines().enumerate() {
        let line_no = i + 1;
        let tokens = scan_line(line, line_no)?;
        if tokens.is_empty() {
            continue;
        }

        match current.take() {
            None => match keyword(&tokens) {
                Some("data") => module.globals.push(global(&tokens, false, line_no)?),
                Some("rodata") => module.globals.push(global(&tokens, true, line_no)?),
                Some("extern") => module.externs.push(extern_decl(&tokens, line_no)?),
                Some("func") => current = Some(func_header(&tokens, line_no)?),
                _ => {
                    return Err(err(line_no, "expected data, rodata, extern or func"));
                }
            },
            Some(mut func) => {
                if tokens == [Token::BlockEnd] {
                    module.functions.push(func);
                } else {
                    func.body.push(inst(&tokens, line_no)?);
                    current = Some(func);
                }
            }
        }
    }

    if let Some(func) = current {
        return Err(err(
            source.lines().count(),
            &format!("unterminated function {:?}", func.name),
        ));
    }

    verify(&module)?;
    Ok(module)
}

fn keyword(tokens: &[Token]) -> Option<&str> {
    match tokens.first() {
        Some(Token::Ident(id)) => Some(id.as_str()),
        _ => None,
    }
}

fn global(tokens: &[Token], read_only: bool, line_no: usize) -> Result<Global> {
    match tokens {
        [Token::Ident(_), Token::Ident(name), Token::Equal, value] => {
            let init = match value {
                Token::Number(n) => GlobalInit::Word(*n as u64),
                Token::Str(bytes) => GlobalInit::Bytes(bytes.clone()),
                _ => return Err(err(line_no, "global initializer must be a number or string")),
            };
            Ok(Global {
                name: name.clone(),
                init,
                read_only,
                placement: None,
            })
        }
        _ => Err(err(line_no, "expected: data|rodata <name> = <value>")),
    }
}

fn extern_decl(tokens: &[Token], line_no: usize) -> Result<String> {
    match tokens {
        [Token::Ident(_), Token::Ident(name)] => Ok(name.clone()),
        _ => Err(err(line_no, "expected: extern <name>")),
    }
}

fn func_header(tokens: &[Token], line_no: usize) -> Result<Function> {
    let [Token::Ident(_), Token::Ident(name), Token::LeftP, rest @ ..] = tokens else {
        return Err(err(line_no, "expected: func <name>(<params>) {"));
    };
    let [params @ .., Token::RightP, Token::BlockStart] = rest else {
        return Err(err(line_no, "expected: func <name>(<params>) {"));
    };

    let mut names = vec![];
    for (i, token) in params.iter().enumerate() {
        match (i % 2, token) {
            (0, Token::Ident(p)) => names.push(p.clone()),
            (1, Token::Comma) => (),
            _ => return Err(err(line_no, "malformed parameter list")),
        }
    }

    Ok(Function {
        name: name.clone(),
        params: names,
        body: vec![],
        placement: None,
    })
}

fn inst(tokens: &[Token], line_no: usize) -> Result<Inst> {
    match tokens {
        [Token::Ident(kw), value] if kw == "ret" => Ok(Inst::Ret {
            value: operand(value, line_no)?,
        }),
        [Token::Ident(dst), Token::Equal, Token::Ident(op), lhs, Token::Comma, rhs]
            if bin_op(op).is_some() =>
        {
            Ok(Inst::Bin {
                op: bin_op(op).unwrap(),
                dst: dst.clone(),
                lhs: operand(lhs, line_no)?,
                rhs: operand(rhs, line_no)?,
            })
        }
        [Token::Ident(dst), Token::Equal, Token::Ident(kw), Token::Ident(global)]
            if kw == "addr" =>
        {
            Ok(Inst::Addr {
                dst: dst.clone(),
                global: global.clone(),
            })
        }
        [Token::Ident(dst), Token::Equal, Token::Ident(kw), Token::Ident(callee), Token::LeftP, rest @ ..]
            if kw == "call" =>
        {
            let [args @ .., Token::RightP] = rest else {
                return Err(err(line_no, "unclosed call argument list"));
            };
            let mut parsed = vec![];
            for (i, token) in args.iter().enumerate() {
                match (i % 2, token) {
                    (0, t) => parsed.push(operand(t, line_no)?),
                    (1, Token::Comma) => (),
                    _ => return Err(err(line_no, "malformed call argument list")),
                }
            }
            Ok(Inst::Call {
                dst: dst.clone(),
                callee: callee.clone(),
                args: parsed,
            })
        }
        [Token::Ident(dst), Token::Equal, value] => Ok(Inst::Copy {
            dst: dst.clone(),
            src: operand(value, line_no)?,
        }),
        _ => Err(err(line_no, "unrecognized instruction")),
    }
}

fn bin_op(name: &str) -> Option<BinOp> {
    match name {
        "add" => Some(BinOp::Add),
        "sub" => Some(BinOp::Sub),
        "mul" => Some(BinOp::Mul),
        _ => None,
    }
}

fn operand(token: &Token, line_no: usize) -> Result<Operand> {
    match token {
        Token::Ident(id) => Ok(Operand::Value(id.clone())),
        Token::Number(n) => Ok(Operand::Literal(*n)),
        _ => Err(err(line_no, "operand must be a value name or literal")),
    }
}

fn err(line: usize, message: &str) -> BuildError {
    BuildError::Parse {
        line,
        message: message.to_string(),
    }
}

/// Structural checks the backend relies on. Call targets are deliberately
/// not required to be defined here; an unknown callee either resolves to a
/// pre-existing symbol at link time or fails the build there.
fn verify(module: &Module) -> Result<()> {
    let mut names = std::collections::HashSet::new();
    for global in &module.globals {
        if !names.insert(global.name.as_str()) {
            return Err(BuildError::Verify(format!(
                "duplicate definition of {:?}",
                global.name
            )));
        }
    }
    for func in &module.functions {
        if !names.insert(func.name.as_str()) {
            return Err(BuildError::Verify(format!(
                "duplicate definition of {:?}",
                func.name
            )));
        }
        verify_function(module, func)?;
    }
    Ok(())
}

fn verify_function(module: &Module, func: &Function) -> Result<()> {
    let mut defined: std::collections::HashSet<&str> =
        func.params.iter().map(String::as_str).collect();

    let use_operand = |op: &Operand, defined: &std::collections::HashSet<&str>| {
        if let Operand::Value(name) = op {
            if !defined.contains(name.as_str()) {
                return Err(BuildError::Verify(format!(
                    "{}: use of undefined value {:?}",
                    func.name, name
                )));
            }
        }
        Ok(())
    };

    let mut terminated = false;
    for inst in &func.body {
        if terminated {
            return Err(BuildError::Verify(format!(
                "{}: instruction after ret",
                func.name
            )));
        }
        let dst = match inst {
            Inst::Copy { dst, src } => {
                use_operand(src, &defined)?;
                Some(dst)
            }
            Inst::Bin { dst, lhs, rhs, .. } => {
                use_operand(lhs, &defined)?;
                use_operand(rhs, &defined)?;
                Some(dst)
            }
            Inst::Addr { dst, global } => {
                if module.global(global).is_none() {
                    return Err(BuildError::Verify(format!(
                        "{}: addr of undeclared global {:?}",
                        func.name, global
                    )));
                }
                Some(dst)
            }
            Inst::Call { dst, args, .. } => {
                for arg in args {
                    use_operand(arg, &defined)?;
                }
                Some(dst)
            }
            Inst::Ret { value } => {
                use_operand(value, &defined)?;
                terminated = true;
                None
            }
        };
        if let Some(dst) = dst {
            if !defined.insert(dst) {
                return Err(BuildError::Verify(format!(
                    "{}: value {:?} defined twice",
                    func.name, dst
                )));
            }
        }
    }

    if !terminated {
        return Err(BuildError::Verify(format!(
            "{}: missing ret",
            func.name
        )));
    }
    Ok(())
}
