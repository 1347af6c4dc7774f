use super::{
    CompiledContract,
    Compiler,
    CompilerError,
    CompilerInput,
};

use std::sync::{
    Arc,
    Mutex,
};

/// Compiler stand-in returning a canned result and recording every input it
/// was handed.
#[derive(Debug, Clone)]
pub struct MockCompiler {
    result: Result<CompiledContract, String>,
    inputs: Arc<Mutex<Vec<CompilerInput>>>,
}

impl MockCompiler {
    pub fn returning(result: CompiledContract) -> Self {
        Self {
            result: Ok(result),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_owned()),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn inputs(&self) -> Vec<CompilerInput> {
        self.inputs.lock().unwrap().clone()
    }
}

impl Compiler for MockCompiler {
    async fn compile(&self, input: &CompilerInput) -> Result<CompiledContract, CompilerError> {
        self.inputs.lock().unwrap().push(input.clone());
        match &self.result {
            Ok(compiled) => Ok(compiled.clone()),
            Err(message) => Err(CompilerError::Failed(message.clone())),
        }
    }
}
