use std::sync::{Arc, Mutex};

use st_tensor::observability::{set_tensor_op_observer, TensorOpEvent};
use st_tensor::{CpuBackend, MathBackend, Shape};

#[test]
fn observer_sees_backend_ops() {
    let seen: Arc<Mutex<Vec<TensorOpEvent>>> = Arc::default();
    let sink = seen.clone();
    set_tensor_op_observer(Some(Arc::new(move |event: &TensorOpEvent| {
        sink.lock().unwrap().push(event.clone());
    })));

    let cpu = CpuBackend::new();
    let x = cpu.from_host(&[0.5, -0.5], &Shape::row(2)).unwrap();
    let mut y = cpu.zeros(&Shape::row(2)).unwrap();
    cpu.sigmoid(&mut y, &x).unwrap();
    cpu.tanh(&mut y, &x).unwrap();

    set_tensor_op_observer(None);
    cpu.fill(&mut y, 0.0).unwrap();

    let events = seen.lock().unwrap();
    let ops: Vec<&str> = events.iter().map(|event| event.op).collect();
    assert_eq!(ops, ["sigmoid", "tanh"]);
    assert!(events.iter().all(|event| event.backend == "cpu"));
    assert_eq!(events[0].shape, Shape::row(2));
}
