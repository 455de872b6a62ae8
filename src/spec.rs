use std::io::Cursor;

use serde_json::Value;
use stellar_xdr::curr::{
    self as xdr, Limited, Limits, ReadXdr, ScSpecEntry, ScSpecFunctionV0, ScSpecTypeDef, ScVal,
    ScSpecUdtErrorEnumV0,
};
use wasmparser::Parser as WasmParser;

/// Name of the wasm custom section carrying the contract's interface spec.
pub const SPEC_SECTION_NAME: &str = "contractspecv0";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("function {0} was not found in the contract spec")]
    FunctionNotFound(String),
    #[error("Missing argument {0}")]
    MissingArgument(String),
    #[error("arguments for {0} must be passed as a json object keyed by parameter name")]
    InvalidArguments(String),
    #[error("missing {SPEC_SECTION_NAME} custom section in contract wasm")]
    MissingSpecSection,
    #[error("cannot parse contract wasm: {0}")]
    CannotParseWasm(#[from] wasmparser::BinaryReaderError),
    #[error("xdr processing error: {0}")]
    Xdr(#[from] xdr::Error),
    #[error(transparent)]
    Value(#[from] soroban_spec_tools::Error),
}

/// A contract's interface: its functions, user-defined types and error
/// cases, in the order they appear in the wasm spec section.
///
/// Conversion between native json values and `ScVal` is delegated to
/// [`soroban_spec_tools::Spec`]; this type adds function-shaped marshalling
/// on top of it.
#[derive(Clone, Default)]
pub struct ContractSpec(soroban_spec_tools::Spec);

impl ContractSpec {
    pub fn new(entries: Vec<ScSpecEntry>) -> Self {
        Self(soroban_spec_tools::Spec::new(entries))
    }

    /// Parses the spec out of a compiled contract's `contractspecv0` custom
    /// section. Each iteration of the stream decoder consumes exactly one
    /// entry; trailing bytes that do not form an entry are logged and
    /// skipped.
    pub fn from_wasm(bytes: &[u8]) -> Result<Self, Error> {
        let mut section: Option<&[u8]> = None;
        for payload in WasmParser::new(0).parse_all(bytes) {
            if let wasmparser::Payload::CustomSection(s) = payload? {
                if s.name() == SPEC_SECTION_NAME {
                    section = Some(s.data());
                }
            }
        }
        let section = section.ok_or(Error::MissingSpecSection)?;

        let mut read = Limited::new(Cursor::new(section), Limits::none());
        let mut entries = Vec::new();
        for entry in ScSpecEntry::read_xdr_iter(&mut read) {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("unexpected trailing bytes in {SPEC_SECTION_NAME}: {e}");
                    break;
                }
            }
        }
        tracing::debug!("read {} spec entries from wasm", entries.len());
        Ok(Self::new(entries))
    }

    pub fn entries(&self) -> &[ScSpecEntry] {
        self.0 .0.as_deref().unwrap_or_default()
    }

    /// Function descriptors, in declaration order.
    pub fn funcs(&self) -> Vec<&ScSpecFunctionV0> {
        self.entries()
            .iter()
            .filter_map(|e| match e {
                ScSpecEntry::FunctionV0(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    pub fn get_func(&self, name: &str) -> Result<&ScSpecFunctionV0, Error> {
        self.0
            .find_function(name)
            .map_err(|_| Error::FunctionNotFound(name.to_string()))
    }

    /// Marshals a json object keyed by parameter name into the ordered
    /// argument list of the named function. Optional parameters may be
    /// omitted; any other missing parameter is an error.
    pub fn func_args_to_scvals(&self, name: &str, args: &Value) -> Result<Vec<ScVal>, Error> {
        let func = self.get_func(name)?;
        let obj = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            _ => return Err(Error::InvalidArguments(name.to_string())),
        };
        func.inputs
            .iter()
            .map(|input| {
                let arg_name = input.name.to_utf8_string_lossy();
                match obj.and_then(|o| o.get(&arg_name)) {
                    Some(value) => Ok(self.0.from_json(value, &input.type_)?),
                    None if matches!(input.type_, ScSpecTypeDef::Option(_)) => Ok(ScVal::Void),
                    None => Err(Error::MissingArgument(arg_name)),
                }
            })
            .collect()
    }

    /// The inverse: converts the named function's return value into native
    /// json. Functions with no declared output yield `null`.
    pub fn func_res_to_native(&self, name: &str, val: &ScVal) -> Result<Value, Error> {
        let func = self.get_func(name)?;
        match func.outputs.first() {
            Some(output) => Ok(self.0.xdr_to_json(val, output)?),
            None => Ok(Value::Null),
        }
    }

    /// Every `(code, message)` pair declared by the contract's error enums.
    /// The case doc is the message; the case name stands in when the doc is
    /// empty.
    pub fn error_cases(&self) -> Vec<(u32, String)> {
        self.entries()
            .iter()
            .filter_map(|e| match e {
                ScSpecEntry::UdtErrorEnumV0(ScSpecUdtErrorEnumV0 { cases, .. }) => Some(cases),
                _ => None,
            })
            .flat_map(|cases| {
                cases.iter().map(|case| {
                    let doc = case.doc.to_utf8_string_lossy();
                    let message = if doc.is_empty() {
                        case.name.to_utf8_string_lossy()
                    } else {
                        doc
                    };
                    (case.value, message)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stellar_xdr::curr::{
        ScSpecFunctionInputV0, ScSpecTypeOption, ScSpecTypeVec, ScSpecUdtErrorEnumCaseV0,
        ScSymbol, WriteXdr,
    };

    fn hello_entry() -> ScSpecEntry {
        ScSpecEntry::FunctionV0(ScSpecFunctionV0 {
            doc: Default::default(),
            name: ScSymbol("hello".try_into().unwrap()),
            inputs: vec![ScSpecFunctionInputV0 {
                doc: Default::default(),
                name: "to".try_into().unwrap(),
                type_: ScSpecTypeDef::Symbol,
            }]
            .try_into()
            .unwrap(),
            outputs: vec![ScSpecTypeDef::Vec(Box::new(ScSpecTypeVec {
                element_type: Box::new(ScSpecTypeDef::Symbol),
            }))]
            .try_into()
            .unwrap(),
        })
    }

    fn swap_entry() -> ScSpecEntry {
        ScSpecEntry::FunctionV0(ScSpecFunctionV0 {
            doc: Default::default(),
            name: ScSymbol("swap".try_into().unwrap()),
            inputs: vec![
                ScSpecFunctionInputV0 {
                    doc: Default::default(),
                    name: "amount".try_into().unwrap(),
                    type_: ScSpecTypeDef::U32,
                },
                ScSpecFunctionInputV0 {
                    doc: Default::default(),
                    name: "memo".try_into().unwrap(),
                    type_: ScSpecTypeDef::Option(Box::new(ScSpecTypeOption {
                        value_type: Box::new(ScSpecTypeDef::U32),
                    })),
                },
            ]
            .try_into()
            .unwrap(),
            outputs: vec![ScSpecTypeDef::U32].try_into().unwrap(),
        })
    }

    fn error_entry() -> ScSpecEntry {
        ScSpecEntry::UdtErrorEnumV0(ScSpecUdtErrorEnumV0 {
            doc: Default::default(),
            lib: Default::default(),
            name: "Error".try_into().unwrap(),
            cases: vec![
                ScSpecUdtErrorEnumCaseV0 {
                    doc: "insufficient".try_into().unwrap(),
                    name: "InsufficientBalance".try_into().unwrap(),
                    value: 3,
                },
                ScSpecUdtErrorEnumCaseV0 {
                    doc: Default::default(),
                    name: "Unauthorized".try_into().unwrap(),
                    value: 4,
                },
            ]
            .try_into()
            .unwrap(),
        })
    }

    fn spec() -> ContractSpec {
        ContractSpec::new(vec![hello_entry(), swap_entry(), error_entry()])
    }

    #[test]
    fn funcs_are_ordered() {
        let names: Vec<String> = spec()
            .funcs()
            .iter()
            .map(|f| f.name.to_utf8_string_lossy())
            .collect();
        assert_eq!(names, vec!["hello", "swap"]);
    }

    #[test]
    fn args_follow_declared_parameter_order() {
        // json object order must not matter
        let args = spec()
            .func_args_to_scvals("swap", &json!({"memo": 7, "amount": 10}))
            .unwrap();
        assert_eq!(args, vec![ScVal::U32(10), ScVal::U32(7)]);
    }

    #[test]
    fn optional_args_default_to_void() {
        let args = spec()
            .func_args_to_scvals("swap", &json!({"amount": 10}))
            .unwrap();
        assert_eq!(args, vec![ScVal::U32(10), ScVal::Void]);
    }

    #[test]
    fn missing_args_fail() {
        match spec().func_args_to_scvals("swap", &json!({"memo": 7})) {
            Err(Error::MissingArgument(name)) => assert_eq!(name, "amount"),
            r => panic!("expected MissingArgument, got: {r:?}"),
        }
    }

    #[test]
    fn unknown_function_fails() {
        match spec().func_args_to_scvals("nope", &json!({})) {
            Err(Error::FunctionNotFound(name)) => assert_eq!(name, "nope"),
            r => panic!("expected FunctionNotFound, got: {r:?}"),
        }
    }

    #[test]
    fn res_to_native() {
        let res = spec()
            .func_res_to_native("swap", &ScVal::U32(42))
            .unwrap();
        assert_eq!(res, json!(42));
    }

    #[test]
    fn error_cases_use_doc_then_name() {
        let cases = spec().error_cases();
        assert_eq!(
            cases,
            vec![
                (3, "insufficient".to_string()),
                (4, "Unauthorized".to_string())
            ]
        );
    }

    #[test]
    fn spec_from_wasm_custom_section() {
        let mut section = Vec::new();
        for entry in [hello_entry(), swap_entry(), error_entry()] {
            section.extend(entry.to_xdr(Limits::none()).unwrap());
        }
        let mut module = wasm_encoder::Module::new();
        module.section(&wasm_encoder::CustomSection {
            name: std::borrow::Cow::Borrowed(SPEC_SECTION_NAME),
            data: std::borrow::Cow::Borrowed(&section),
        });
        let wasm = module.finish();

        let spec = ContractSpec::from_wasm(&wasm).unwrap();
        assert_eq!(spec.entries().len(), 3);
        assert_eq!(spec.funcs().len(), 2);
    }

    #[test]
    fn spec_from_wasm_without_section_fails() {
        let wasm = wasm_encoder::Module::new().finish();
        let err = ContractSpec::from_wasm(&wasm)
            .err()
            .expect("expected an error");
        assert!(matches!(err, Error::MissingSpecSection), "got: {err:?}");
    }
}
