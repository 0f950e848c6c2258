#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Equal,
    Comma,
    LeftP,
    RightP,
    BlockStart,
    BlockEnd,
    Whitespace,
    Ident(String),
    Str(Vec<u8>),
    Number(i64),
}
