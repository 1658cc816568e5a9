//! DAP protocol constants
//!
//! Centralizes the command, event and field names shared by the client,
//! the connection manager and the adapter policies.

/// DAP event types received from debug adapters
pub mod events {
    /// Initialized event - adapter ready for configuration
    pub const INITIALIZED: &str = "initialized";
    /// Output event - console/stdout/stderr output
    pub const OUTPUT: &str = "output";
    /// Stopped event - breakpoint hit, step, pause, entry
    pub const STOPPED: &str = "stopped";
    /// Continued event - execution resumed
    pub const CONTINUED: &str = "continued";
    /// Thread event - thread started or exited
    pub const THREAD: &str = "thread";
    /// Exited event - debuggee process exited
    pub const EXITED: &str = "exited";
    /// Terminated event - debug session ended
    pub const TERMINATED: &str = "terminated";
}

/// DAP request command names
pub mod requests {
    pub const INITIALIZE: &str = "initialize";
    pub const LAUNCH: &str = "launch";
    pub const ATTACH: &str = "attach";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONFIGURATION_DONE: &str = "configurationDone";
    pub const SET_BREAKPOINTS: &str = "setBreakpoints";
    pub const SET_EXCEPTION_BREAKPOINTS: &str = "setExceptionBreakpoints";
    pub const SET_FUNCTION_BREAKPOINTS: &str = "setFunctionBreakpoints";
    pub const SET_DATA_BREAKPOINTS: &str = "setDataBreakpoints";
    pub const SET_INSTRUCTION_BREAKPOINTS: &str = "setInstructionBreakpoints";
    pub const THREADS: &str = "threads";
    pub const PAUSE: &str = "pause";
    pub const CONTINUE: &str = "continue";
    pub const NEXT: &str = "next";
    pub const STEP_IN: &str = "stepIn";
    pub const STEP_OUT: &str = "stepOut";
    pub const STACK_TRACE: &str = "stackTrace";
    pub const SCOPES: &str = "scopes";
    pub const VARIABLES: &str = "variables";
    pub const EVALUATE: &str = "evaluate";
}

/// Requests sent by the adapter to the client
pub mod reverse_requests {
    /// Ask the client to run the debuggee in a terminal
    pub const RUN_IN_TERMINAL: &str = "runInTerminal";
    /// Ask the client to start a secondary debug session
    pub const START_DEBUGGING: &str = "startDebugging";
}

/// Client identification sent in `initialize`
pub mod client {
    /// clientID prefix for parent sessions (`dapx-<session id>`)
    pub const CLIENT_ID_PREFIX: &str = "dapx";
    /// clientID prefix for child sessions (`dapx-child-<pending id>`)
    pub const CHILD_CLIENT_ID_PREFIX: &str = "dapx-child";
    pub const CLIENT_NAME: &str = "dapx proxy";
    pub const LOCALE: &str = "en-US";
    pub const PATH_FORMAT: &str = "path";
}

/// Launch argument defaults
pub mod launch {
    pub const CONSOLE_INTERNAL: &str = "internalConsole";
}

/// Key carrying the pending target id in js-debug child configurations
pub const PENDING_TARGET_ID_KEY: &str = "__pendingTargetId";
