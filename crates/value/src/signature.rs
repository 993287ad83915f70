use crate::{Error, Tag, Value};

/// Parsed form of a native-callback type descriptor pair.
///
/// Descriptors are short strings of single-letter codes, one per
/// parameter: `v`=void, `i`=i32, `f`=f32, `b`=bool, `s`=string,
/// `[`=array. The return descriptor holds at most one code; empty means
/// void.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    params: Vec<Tag>,
    ret: Tag,
}

impl Signature {
    pub fn parse(params: &str, ret: &str) -> Result<Signature, Error> {
        let params: Vec<Tag> = params.chars().map(Tag::from_letter).collect();
        if params.len() > u8::MAX as usize {
            return Err(Error::TooManyParameters(params.len()));
        }
        let ret = ret.chars().next().map_or(Tag::Void, Tag::from_letter);
        Ok(Signature { params, ret })
    }

    pub fn params(&self) -> &[Tag] {
        &self.params
    }

    pub fn ret(&self) -> Tag {
        self.ret
    }

    pub fn arity(&self) -> u8 {
        self.params.len() as u8
    }
}

/// Adapts a full argument vector to a signature, coercing each element to
/// its declared parameter type. Errors carry the 1-based index of the
/// first parameter that would not convert.
pub fn adapt_args(args: &[Value], signature: &Signature) -> Result<Vec<Value>, Error> {
    if args.len() != signature.params().len() {
        return Err(Error::Arity {
            expected: signature.params().len(),
            got: args.len(),
        });
    }
    args.iter()
        .zip(signature.params())
        .enumerate()
        .map(|(index, (arg, want))| {
            arg.coerce(*want).map_err(|_| Error::Parameter {
                index: index + 1,
                from: arg.tag(),
                to: *want,
            })
        })
        .collect()
}

/// Adapts a callback's returned value to its declared return type.
/// A void return discards whatever the callback produced.
pub fn adapt_return(value: Value, signature: &Signature) -> Result<Value, Error> {
    if signature.ret() == Tag::Void {
        return Ok(Value::Void);
    }
    let from = value.tag();
    value.coerce(signature.ret()).map_err(|_| Error::Return {
        from,
        to: signature.ret(),
    })
}
