use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::envelope::{Identity, TransportMessage, TransportMessageBuilder};

/// A typed payload on its way to becoming an envelope.
///
/// Producers hand the pipeline a payload plus the envelope metadata; the
/// serialization layer turns it into a byte-bodied [`TransportMessage`].
pub struct Typed<P> {
    message_type: String,
    identity: Identity,
    headers: Vec<(String, String)>,
    payload: P,
}

impl<P> Typed<P> {
    pub fn new(message_type: impl Into<String>, identity: Identity, payload: P) -> Self {
        Self {
            message_type: message_type.into(),
            identity,
            headers: Vec::new(),
            payload,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Tower `Service` wrapper that serializes typed payloads to JSON.
///
/// Converts a [`Typed<P>`] request into a [`TransportMessage`] whose body is
/// the payload's JSON bytes and whose content type is `application/json`,
/// then passes it to the inner service.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, P> Service<Typed<P>> for JsonService<T>
where
    P: serde::Serialize + Send + 'static,
    T: Service<TransportMessage> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Typed<P>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let body = serde_json::to_vec(&req.payload)?;
            let mut builder: TransportMessageBuilder =
                TransportMessage::build(req.message_type, req.identity)
                    .body(body)
                    .content_type("application/json")
                    .sent_now();
            for (key, value) in req.headers {
                builder = builder.header(key, value);
            }

            inner.call(builder.finish()).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`JsonService`] to a service stack.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::Serialize;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        topology::TopologyRegistry,
        transport::{InMemoryTransport, PublishService},
    };

    #[derive(Serialize)]
    struct OrderPlaced {
        order: u64,
    }

    #[tokio::test]
    async fn json_layer_produces_a_wire_ready_envelope() {
        let transport = Arc::new(InMemoryTransport::new(TopologyRegistry::new()));
        let pipeline = JsonLayer.layer(PublishService::new(Arc::clone(&transport)));

        let request = Typed::new(
            "OrderPlaced",
            Identity::for_message(),
            OrderPlaced { order: 42 },
        )
        .header("tenant", "clinic-7");

        pipeline.oneshot(request).await.unwrap();

        let published = transport.published("OrderPlaced").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].content_type(), Some("application/json"));
        assert_eq!(published[0].header("tenant"), Some("clinic-7"));
        assert!(published[0].sent_time().is_some());

        let body: serde_json::Value = serde_json::from_slice(published[0].body()).unwrap();
        assert_eq!(body["order"], 42);
    }
}
