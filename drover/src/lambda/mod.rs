//! AWS Lambda plumbing for the remote executor: function deployment and
//! invocation, plus the IAM role the deployed function runs under.

mod client;
mod iam;

pub(crate) use client::{FunctionConfig, Invoker, LambdaClient, RawInvocation};
pub(crate) use iam::IamClient;

/// Name of the IAM role deployed when the driver manages permissions itself.
pub(crate) const EXECUTION_ROLE_NAME: &str = "DroverExecutionRole";
