use std::fmt;

/// Wire discriminator carried in the first four bytes of every payload.
/// The numeric values are part of the protocol and shared by both peers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestKind {
    Invalid = 0,
    SortArray = 1,
    FindPrimes = 2,
    CalcFunction = 3,
    CancelTask = 4,
    ProgressRange = 5,
    ProgressValue = 6,
}

impl RequestKind {
    /// Maps a raw discriminator back to a kind. Unknown values are the
    /// caller's problem to report as `InvalidRequestType`.
    #[inline]
    pub fn from_wire(raw: u32) -> Option<RequestKind> {
        match raw {
            0 => Some(RequestKind::Invalid),
            1 => Some(RequestKind::SortArray),
            2 => Some(RequestKind::FindPrimes),
            3 => Some(RequestKind::CalcFunction),
            4 => Some(RequestKind::CancelTask),
            5 => Some(RequestKind::ProgressRange),
            6 => Some(RequestKind::ProgressValue),
            _ => None,
        }
    }

    /// True for the kinds that create a server-side task and participate in
    /// the result cache.
    #[inline]
    pub fn is_task(self) -> bool {
        match self {
            RequestKind::SortArray | RequestKind::FindPrimes | RequestKind::CalcFunction => true,
            _ => false,
        }
    }
}

impl From<RequestKind> for u32 {
    #[inline]
    fn from(kind: RequestKind) -> u32 {
        kind as u32
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RequestKind::Invalid => "InvalidRequest",
            RequestKind::SortArray => "SortArray",
            RequestKind::FindPrimes => "FindPrimeNumbers",
            RequestKind::CalcFunction => "CalculateFunction",
            RequestKind::CancelTask => "CancelCurrentTask",
            RequestKind::ProgressRange => "ProgressRange",
            RequestKind::ProgressValue => "ProgressValue",
        };
        f.write_str(name)
    }
}

/// Error taxonomy surfaced on the wire inside `Request::Invalid`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    Unspecified = 0,
    CorruptedData = 1,
    InvalidRequestType = 2,
    AlreadyRunningTask = 3,
    NotRunningAnyTask = 4,
}

impl ErrorCode {
    #[inline]
    pub fn from_wire(raw: u32) -> Option<ErrorCode> {
        match raw {
            0 => Some(ErrorCode::Unspecified),
            1 => Some(ErrorCode::CorruptedData),
            2 => Some(ErrorCode::InvalidRequestType),
            3 => Some(ErrorCode::AlreadyRunningTask),
            4 => Some(ErrorCode::NotRunningAnyTask),
            _ => None,
        }
    }

    /// Canonical human readable description for the code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Unspecified => "",
            ErrorCode::CorruptedData => "Received message with corrupted data",
            ErrorCode::InvalidRequestType => "Received message with invalid request type",
            ErrorCode::AlreadyRunningTask => "Received task request while already running task",
            ErrorCode::NotRunningAnyTask => "Received CancelCurrentTask while not running any task",
        }
    }
}

impl From<ErrorCode> for u32 {
    #[inline]
    fn from(code: ErrorCode) -> u32 {
        code as u32
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EquationType {
    Linear = 0,
    Quadratic = 1,
}

impl EquationType {
    #[inline]
    pub fn from_wire(raw: u32) -> Option<EquationType> {
        match raw {
            0 => Some(EquationType::Linear),
            1 => Some(EquationType::Quadratic),
            _ => None,
        }
    }
}

impl From<EquationType> for u32 {
    #[inline]
    fn from(eq: EquationType) -> u32 {
        eq as u32
    }
}

impl fmt::Display for EquationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EquationType::Linear => f.write_str("Linear"),
            EquationType::Quadratic => f.write_str("Quadratic"),
        }
    }
}

/// A tabulated function point. `y` wraps per two's-complement on overflow,
/// which is part of the wire contract (`y` travels as `i32`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    #[inline]
    pub fn new(x: i32, y: i32) -> Point {
        Point { x, y }
    }
}

/// A protocol message. The same variant travels in both directions: a task
/// submission carries empty outputs, the matching response carries them
/// populated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Request {
    Invalid {
        code: ErrorCode,
        text: String,
    },
    SortArray {
        numbers: Vec<i32>,
    },
    FindPrimes {
        x_from: i32,
        x_to: i32,
        primes: Vec<i32>,
    },
    CalcFunction {
        equation: EquationType,
        x_from: i32,
        x_to: i32,
        x_step: i32,
        a: i32,
        b: i32,
        c: i32,
        points: Vec<Point>,
    },
    CancelTask,
    ProgressRange {
        minimum: i32,
        maximum: i32,
    },
    ProgressValue {
        value: i32,
    },
}

impl Request {
    #[inline]
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Invalid { .. } => RequestKind::Invalid,
            Request::SortArray { .. } => RequestKind::SortArray,
            Request::FindPrimes { .. } => RequestKind::FindPrimes,
            Request::CalcFunction { .. } => RequestKind::CalcFunction,
            Request::CancelTask => RequestKind::CancelTask,
            Request::ProgressRange { .. } => RequestKind::ProgressRange,
            Request::ProgressValue { .. } => RequestKind::ProgressValue,
        }
    }

    /// Builds an `Invalid` reply carrying the code's canonical description.
    #[inline]
    pub fn invalid(code: ErrorCode) -> Request {
        Request::Invalid {
            code,
            text: code.description().to_string(),
        }
    }
}
