// Changes the process-wide default, so it lives in its own test binary.

use leaky_relu::backend::{get_backend, set_backend, Backend};
use leaky_relu::backprop::leaky_relu;
use leaky_relu::function::Variable;
use leaky_relu::tensor;

#[test]
fn test_default_backend_tags_new_tensors() {
    assert_eq!(get_backend(), Backend::Cpu);
    let before = tensor!([1.0, -1.0]);

    set_backend(Backend::Wgpu);
    assert_eq!(get_backend(), Backend::Wgpu);
    let after = tensor!([1.0, -1.0]);
    assert_eq!(before.backend(), Backend::Cpu);
    assert_eq!(after.backend(), Backend::Wgpu);

    // output follows the input's tag
    let y = leaky_relu(&Variable::new(after), 0.5).unwrap();
    assert_eq!(y.data().backend(), Backend::Wgpu);
    assert_eq!(y.data().data, vec![1.0, -0.5]);

    set_backend(Backend::Cpu);
    assert_eq!(tensor!([0.0]).backend(), Backend::Cpu);
}
