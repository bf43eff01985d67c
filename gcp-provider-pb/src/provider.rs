#[path = "provider/v1alpha1.rs"]
#[rustfmt::skip]
pub mod v1alpha1;
