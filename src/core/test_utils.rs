//! Test utilities for building objects by hand.
//!
//! These let linker and session tests run without going through the C
//! front end.

#[cfg(test)]
pub mod test {
    use crate::core::compiler::{CompileBackend, CompileOptions, CompileOutput};
    use crate::core::diagnostic::{Diagnostic, Location, Stage};
    use crate::core::object::{CompiledObject, DefinedSymbol, Section, SectionKind, Signature, ValueKind};
    use crate::core::registry::SymbolKind;

    /// Backend that ignores its source and hands out a fixed result.
    pub struct FixedBackend {
        result: Result<CompiledObject, String>,
    }

    impl FixedBackend {
        pub fn new(object: CompiledObject) -> Self {
            Self { result: Ok(object) }
        }

        /// Always fails with one parse error carrying `message`.
        pub fn failing(message: &str) -> Self {
            Self {
                result: Err(message.to_string()),
            }
        }
    }

    impl CompileBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }

        fn compile(&self, _source: &str, _options: &CompileOptions) -> Result<CompileOutput, Vec<Diagnostic>> {
            match &self.result {
                Ok(object) => Ok(CompileOutput::new(object.clone())),
                Err(message) => Err(vec![
                    Diagnostic::error(Stage::Parse, message.clone()).at(Location::new(1, 1))
                ]),
            }
        }
    }

    /// `mov eax, imm32; ret`
    pub fn ret_imm32(value: i32) -> Vec<u8> {
        let mut code = vec![0xB8];
        code.extend_from_slice(&value.to_le_bytes());
        code.push(0xC3);
        code
    }

    /// `lea eax, [rdi + rsi]; ret`
    pub fn add_args() -> Vec<u8> {
        vec![0x8D, 0x04, 0x37, 0xC3]
    }

    /// Object with a single `.text` section holding one global function
    /// named `name` that spans all of `code`.
    pub fn text_object(name: &str, code: Vec<u8>) -> CompiledObject {
        let mut object = CompiledObject::new();
        let size = code.len();
        let text = object.add_section(Section::new(SectionKind::Text, code, 16));
        object.define(DefinedSymbol {
            name: name.to_string(),
            kind: SymbolKind::Function,
            section: text,
            offset: 0,
            size,
            global: true,
            signature: None,
        });
        object
    }

    /// Like [`text_object`] but records an `int(int, int)`-style signature.
    pub fn typed_text_object(name: &str, code: Vec<u8>, params: Vec<ValueKind>) -> CompiledObject {
        let mut object = text_object(name, code);
        object.symbols[0].signature = Some(Signature {
            params,
            ret: Some(ValueKind::I32),
            variadic: false,
        });
        object
    }
}
