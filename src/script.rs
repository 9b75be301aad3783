/*!
 * Script engine seam
 *
 * The embedded script interpreter is an external collaborator. The core
 * needs five things from it: allocate an interpreter, evaluate a script,
 * deallocate, read the result, and log evaluation errors. Everything else
 * about the language and its commands lives behind this trait.
 */

use tracing::error;

/// Evaluation outcome: the interpreter result string plus any captured
/// error code/info strings, in the shape the job queues expose to waiters.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    /// Zero for success, interpreter-defined otherwise
    pub code: i32,
    pub result: String,
    pub error_code: Option<String>,
    pub error_info: Option<String>,
}

impl ScriptOutcome {
    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// An allocated interpreter, bound to one connection or one job at a time.
pub trait InterpHandle: Send {
    fn set_result(&mut self, result: &str);

    fn result(&self) -> &str;
}

/// The embedded script interpreter.
pub trait ScriptEngine: Send + Sync {
    fn allocate(&self) -> Box<dyn InterpHandle>;

    fn eval(&self, interp: &mut dyn InterpHandle, script: &str) -> ScriptOutcome;

    fn deallocate(&self, _interp: Box<dyn InterpHandle>) {}

    /// Log a failed evaluation.
    fn log_error(&self, script: &str, outcome: &ScriptOutcome) {
        error!(
            code = outcome.code,
            error_code = outcome.error_code.as_deref().unwrap_or(""),
            "script evaluation failed: {}",
            script.chars().take(80).collect::<String>()
        );
    }
}

/// Placeholder engine for servers built without an embedded interpreter:
/// every evaluation fails with a fixed error.
pub struct NullEngine;

struct NullInterp {
    result: String,
}

impl InterpHandle for NullInterp {
    fn set_result(&mut self, result: &str) {
        self.result = result.to_string();
    }

    fn result(&self) -> &str {
        &self.result
    }
}

impl ScriptEngine for NullEngine {
    fn allocate(&self) -> Box<dyn InterpHandle> {
        Box::new(NullInterp {
            result: String::new(),
        })
    }

    fn eval(&self, _interp: &mut dyn InterpHandle, _script: &str) -> ScriptOutcome {
        ScriptOutcome {
            code: 1,
            result: String::new(),
            error_code: Some("NOENGINE".to_string()),
            error_info: Some("no script engine configured".to_string()),
        }
    }
}
