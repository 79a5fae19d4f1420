//! # CRD Generator
//!
//! Prints the `Subscription` and `Application` CustomResourceDefinitions as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/subscription.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use eventing_controller::crd::{Application, Subscription};
use kube::core::CustomResourceExt;

fn main() {
    let crds = [Subscription::crd(), Application::crd()];

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
