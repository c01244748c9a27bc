//! Kubernetes and OpenShift perceiver backends.
//!
//! `pod` reconciles scan results onto cluster pods; `image` does the
//! same for OpenShift `image.openshift.io/v1` Image objects, which the
//! cluster API serves but k8s-openapi does not model.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod image;
pub mod pod;

pub use self::image::{Image, ImageAdapter, ImageInventory};
pub use self::pod::{PodAdapter, PodInventory};

use kube::Error;
use perceiver_annotate::AdapterError;

fn adapter_error(name: &str, error: Error) -> AdapterError {
    match &error {
        Error::Api(response) if response.code == 404 => AdapterError::NotFound(name.to_string()),
        Error::Api(response) if response.code == 409 => AdapterError::Conflict(name.to_string()),
        Error::Api(response) if response.code == 401 || response.code == 403 => {
            AdapterError::Auth(name.to_string())
        }
        _ => AdapterError::Other(error.into()),
    }
}
