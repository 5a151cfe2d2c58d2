//! NoOp Interceptor - the identity interceptor.

use crate::Interceptor;

/// NoOp is an Interceptor that does not modify any packets. It can be
/// embedded in other interceptors, so it's possible to implement only a
/// subset of the methods.
///
/// An empty [`Registry`](crate::Registry) builds a `NoOp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOp;

impl Interceptor for NoOp {}
