//! Responses correlated to earlier requests, and the broker exception model.

use std::fmt;

use crate::error::OpenWireError;
use crate::protocol::constants;
use crate::protocol::marshal::openwire_struct;

use super::Command;

/// One frame of a broker-side stack trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StackTraceElement {
    /// Declaring class of the frame's method.
    pub class_name: String,
    /// Method name.
    pub method_name: String,
    /// Source file, when known.
    pub file_name: Option<String>,
    /// Source line, or a negative value when unknown.
    pub line_number: i32,
}

/// An exception raised inside the broker and carried back on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BrokerError {
    /// Fully qualified exception class name.
    pub exception_class: String,
    /// Exception message.
    pub message: Option<String>,
    /// Stack frames, only marshalled when stack traces are enabled.
    pub stack_trace: Vec<StackTraceElement>,
    /// The exception that caused this one.
    pub cause: Option<Box<BrokerError>>,
}

impl BrokerError {
    /// Creates an error with a class and message and no stack trace.
    pub fn new(exception_class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_class: exception_class.into(),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Creates the error reported for a failure detected on this side of the
    /// connection.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(constants::IO_EXCEPTION_CLASS, message)
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.exception_class, message),
            None => f.write_str(&self.exception_class),
        }
    }
}

impl From<BrokerError> for OpenWireError {
    fn from(error: BrokerError) -> Self {
        OpenWireError::Broker {
            exception_class: error.exception_class,
            message: error.message.unwrap_or_default(),
        }
    }
}

openwire_struct! {
    /// Plain acknowledgement of a request.
    pub struct Response : constants::RESPONSE {
        command_id: int,
        response_required: bool,
        correlation_id: int,
    }
}

openwire_struct! {
    /// A request that failed inside the broker.
    pub struct ExceptionResponse : constants::EXCEPTION_RESPONSE {
        command_id: int,
        response_required: bool,
        correlation_id: int,
        exception: throwable,
    }
}

openwire_struct! {
    /// A response carrying one structure.
    pub struct DataResponse : constants::DATA_RESPONSE {
        command_id: int,
        response_required: bool,
        correlation_id: int,
        data: nested<Command>,
    }
}

openwire_struct! {
    /// A response carrying several structures.
    pub struct DataArrayResponse : constants::DATA_ARRAY_RESPONSE {
        command_id: int,
        response_required: bool,
        correlation_id: int,
        data: array<Command>,
    }
}

openwire_struct! {
    /// A response carrying a single integer.
    pub struct IntegerResponse : constants::INTEGER_RESPONSE {
        command_id: int,
        response_required: bool,
        correlation_id: int,
        result: int,
    }
}

impl Response {
    /// Creates a response to the request with id `correlation_id`.
    pub fn for_request(correlation_id: i32) -> Self {
        Self {
            correlation_id,
            ..Self::default()
        }
    }
}

impl ExceptionResponse {
    /// Creates a failure response to the request with id `correlation_id`.
    pub fn for_request(correlation_id: i32, exception: BrokerError) -> Self {
        Self {
            correlation_id,
            exception: Some(exception),
            ..Self::default()
        }
    }

    /// Converts the carried exception into an error value.
    pub fn to_error(&self) -> OpenWireError {
        match &self.exception {
            Some(error) => error.clone().into(),
            None => OpenWireError::Broker {
                exception_class: String::new(),
                message: "exception response without an exception".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let error = BrokerError::new("javax.jms.JMSException", "boom");
        assert_eq!(error.to_string(), "javax.jms.JMSException: boom");
        let bare = BrokerError {
            exception_class: "java.lang.Error".to_string(),
            ..BrokerError::default()
        };
        assert_eq!(bare.to_string(), "java.lang.Error");
    }

    #[test]
    fn test_exception_response_to_error() {
        let response = ExceptionResponse::for_request(
            4,
            BrokerError::new("javax.jms.InvalidDestinationException", "no such queue"),
        );
        match response.to_error() {
            OpenWireError::Broker {
                exception_class,
                message,
            } => {
                assert_eq!(exception_class, "javax.jms.InvalidDestinationException");
                assert_eq!(message, "no such queue");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_io_error_class() {
        assert_eq!(BrokerError::io("lost").exception_class, "java.io.IOException");
    }
}
