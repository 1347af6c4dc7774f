pub mod compilers;
pub use compilers::{
    CompiledContract,
    Compiler,
    CompilerError,
    CompilerInput,
    SolcCompiler,
};
#[cfg(any(test, feature = "test"))]
pub use compilers::MockCompiler;

mod injector;
pub use injector::{
    add_library_links,
    InjectionFile,
    InjectionOutcome,
    InjectionRequest,
    Injector,
    InjectorError,
    MatchStatus,
};

mod matcher;
pub use matcher::{
    match_runtime_code,
    strip_auxdata,
    Verdict,
};

mod repository;
pub use repository::{
    Repository,
    RepositoryError,
};
