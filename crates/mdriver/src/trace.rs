//! Allocation trace files.
//!
//! A trace starts with four header numbers, one per line, followed by one
//! operation per line:
//!
//! ```text
//! <suggested heap size>
//! <number of ids>
//! <number of operations>
//! <weight>
//! a <id> <size>
//! r <id> <size>
//! f <id>
//! ```
//!
//! Blank lines are ignored.

use std::{num::ParseIntError, str::FromStr};

use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Allocate { id: usize, size: usize },
    Resize { id: usize, size: usize },
    Release { id: usize },
}

impl Op {
    #[must_use]
    pub fn id(self) -> usize {
        match self {
            Self::Allocate { id, .. } | Self::Resize { id, .. } | Self::Release { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub suggested_heap_size: usize,
    pub num_ids: usize,
    pub weight: u32,
    pub ops: Vec<Op>,
}

#[derive(Debug, Snafu)]
pub enum ParseTraceError {
    #[snafu(display("trace ended before the {field} header"))]
    MissingHeader { field: &'static str },
    #[snafu(display("line {line}: invalid number {text:?}"))]
    InvalidNumber {
        line: usize,
        text: String,
        #[snafu(source)]
        source: ParseIntError,
    },
    #[snafu(display("line {line}: unknown operation {op:?}"))]
    UnknownOp { line: usize, op: String },
    #[snafu(display("line {line}: missing {field}"))]
    MissingField { line: usize, field: &'static str },
    #[snafu(display("line {line}: unexpected trailing input {text:?}"))]
    TrailingInput { line: usize, text: String },
    #[snafu(display("line {line}: id {id} is out of range: num_ids={num_ids}"))]
    IdOutOfRange {
        line: usize,
        id: usize,
        num_ids: usize,
    },
    #[snafu(display("operation count mismatch: header={expected}, found={found}"))]
    OpCountMismatch { expected: usize, found: usize },
}

fn parse_number<T>(line: usize, text: &str) -> Result<T, ParseTraceError>
where
    T: FromStr<Err = ParseIntError>,
{
    text.parse().context(InvalidNumberSnafu { line, text })
}

impl FromStr for Trace {
    type Err = ParseTraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = s
            .lines()
            .enumerate()
            .map(|(i, text)| (i + 1, text.trim()))
            .filter(|(_, text)| !text.is_empty());

        let mut header = |field: &'static str| {
            let (line, text) = lines.next().context(MissingHeaderSnafu { field })?;
            Ok::<_, ParseTraceError>((line, text))
        };
        let (line, text) = header("heap size")?;
        let suggested_heap_size = parse_number(line, text)?;
        let (line, text) = header("id count")?;
        let num_ids = parse_number(line, text)?;
        let (line, text) = header("operation count")?;
        let num_ops = parse_number(line, text)?;
        let (line, text) = header("weight")?;
        let weight = parse_number(line, text)?;

        let ops = lines
            .map(|(line, text)| parse_op(line, text, num_ids))
            .collect::<Result<Vec<_>, _>>()?;
        ensure!(
            ops.len() == num_ops,
            OpCountMismatchSnafu {
                expected: num_ops,
                found: ops.len(),
            }
        );

        Ok(Self {
            suggested_heap_size,
            num_ids,
            weight,
            ops,
        })
    }
}

fn parse_op(line: usize, text: &str, num_ids: usize) -> Result<Op, ParseTraceError> {
    let mut fields = text.split_whitespace();
    let kind = fields.next().unwrap_or_default();
    let mut number = |field: &'static str| {
        let text = fields.next().context(MissingFieldSnafu { line, field })?;
        parse_number::<usize>(line, text)
    };

    let op = match kind {
        "a" => Op::Allocate {
            id: number("id")?,
            size: number("size")?,
        },
        "r" => Op::Resize {
            id: number("id")?,
            size: number("size")?,
        },
        "f" => Op::Release { id: number("id")? },
        _ => return UnknownOpSnafu { line, op: kind }.fail(),
    };
    if let Some(text) = fields.next() {
        return TrailingInputSnafu { line, text }.fail();
    }

    let id = op.id();
    ensure!(id < num_ids, IdOutOfRangeSnafu { line, id, num_ids });
    Ok(op)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: &str = "\
20000
3
6
1
a 0 2040
a 1 2040
r 1 48
f 1
a 2 48
f 0
";

    #[test]
    fn test_parse() {
        let trace = SHORT.parse::<Trace>().unwrap();
        assert_eq!(trace.suggested_heap_size, 20000);
        assert_eq!(trace.num_ids, 3);
        assert_eq!(trace.weight, 1);
        assert_eq!(
            trace.ops,
            [
                Op::Allocate { id: 0, size: 2040 },
                Op::Allocate { id: 1, size: 2040 },
                Op::Resize { id: 1, size: 48 },
                Op::Release { id: 1 },
                Op::Allocate { id: 2, size: 48 },
                Op::Release { id: 0 },
            ]
        );
    }

    #[test]
    fn test_blank_lines_and_spacing() {
        let trace = "\n 100 \n1\n\n2\n0\n  a  0   8 \n\nf 0\n"
            .parse::<Trace>()
            .unwrap();
        assert_eq!(trace.ops.len(), 2);
        assert_eq!(trace.weight, 0);
    }

    #[test]
    fn test_missing_header() {
        let err = "100\n1\n".parse::<Trace>().unwrap_err();
        assert!(matches!(
            err,
            ParseTraceError::MissingHeader {
                field: "operation count"
            }
        ));
    }

    #[test]
    fn test_invalid_number() {
        let err = "100\n1\n1\n1\na 0 x\n".parse::<Trace>().unwrap_err();
        assert!(matches!(err, ParseTraceError::InvalidNumber { line: 5, .. }));
        assert_eq!(err.to_string(), "line 5: invalid number \"x\"");
    }

    #[test]
    fn test_unknown_op() {
        let err = "100\n1\n1\n1\nm 0 8\n".parse::<Trace>().unwrap_err();
        assert!(matches!(&err, ParseTraceError::UnknownOp { line: 5, op } if op == "m"));
    }

    #[test]
    fn test_missing_field() {
        let err = "100\n1\n1\n1\na 0\n".parse::<Trace>().unwrap_err();
        assert!(matches!(
            err,
            ParseTraceError::MissingField {
                line: 5,
                field: "size"
            }
        ));
    }

    #[test]
    fn test_trailing_input() {
        let err = "100\n1\n1\n1\nf 0 8\n".parse::<Trace>().unwrap_err();
        assert!(matches!(err, ParseTraceError::TrailingInput { line: 5, .. }));
    }

    #[test]
    fn test_id_out_of_range() {
        let err = "100\n1\n1\n1\na 1 8\n".parse::<Trace>().unwrap_err();
        assert!(matches!(
            err,
            ParseTraceError::IdOutOfRange {
                id: 1,
                num_ids: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_op_count_mismatch() {
        let err = "100\n1\n2\n1\na 0 8\n".parse::<Trace>().unwrap_err();
        assert!(matches!(
            err,
            ParseTraceError::OpCountMismatch {
                expected: 2,
                found: 1
            }
        ));
    }
}
