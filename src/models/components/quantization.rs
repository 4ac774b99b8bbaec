use candle_core::quantized::QTensor;
use candle_core::{Module, Result, Tensor};
use std::sync::Arc;

/// A quantized matrix multiplication with its own tracing span.
#[derive(Clone)]
pub struct QMatMul {
    inner: candle_core::quantized::QMatMul,
    span: tracing::Span,
}

impl QMatMul {
    pub fn from_qtensor(ws: QTensor) -> Result<Self> {
        Self::from_arc(Arc::new(ws))
    }

    pub fn from_arc(ws: Arc<QTensor>) -> Result<Self> {
        let inner = candle_core::quantized::QMatMul::from_arc(ws)?;
        let span = tracing::span!(tracing::Level::TRACE, "qmatmul");
        Ok(Self { inner, span })
    }
}

impl Module for QMatMul {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(xs)
    }
}

impl std::fmt::Debug for QMatMul {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QMatMul")
    }
}
