use opentelemetry::{
    metrics::{Counter, Meter},
    Key,
};

const OPERATION_KEY: Key = Key::from_static_str("operation");

pub struct DrainControllerMetrics {
    drain_controller_op: Counter<u64>,
}

impl DrainControllerMetrics {
    pub fn new(meter: Meter) -> Self {
        let drain_controller_op = meter
            .u64_counter("drain_controller_op")
            .with_description("Drain coordinator operations")
            .init();
        DrainControllerMetrics {
            drain_controller_op,
        }
    }

    pub fn no_op(&self) {
        self.op("no_op");
    }

    pub fn op(&self, operation: &str) {
        let labels = vec![OPERATION_KEY.string(operation.to_string())];
        self.drain_controller_op.add(1, &labels);
    }
}
