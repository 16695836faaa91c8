// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use duplex_rpc::codec::Value;
use duplex_rpc::registry::{RegistryBuilder, ServiceBuilder};

#[test]
fn nested_services_flatten_to_dotted_paths() {
    let registry = RegistryBuilder::new()
        .mount(
            ServiceBuilder::new("accounts")
                .reply("Create", "S", Arc::new(|rt, _args| rt.ok(Value::Null)))
                .child(
                    ServiceBuilder::new("billing")
                        .reply("Charge", "IF", Arc::new(|rt, _args| rt.ok(Value::Null))),
                ),
        )
        .build()
        .expect("registry should build");

    assert_eq!(registry.len(), 2);
    let charge = registry.lookup("#.accounts.billing:Charge").expect("charge reply");
    assert_eq!(charge.arg_count(), 2);
}

#[test]
fn unknown_path_misses() {
    let registry = RegistryBuilder::new()
        .mount(ServiceBuilder::new("accounts").reply("Create", "S", Arc::new(|rt, _args| rt.ok(Value::Null))))
        .build()
        .expect("registry should build");
    assert!(registry.lookup("#.accounts:Delete").is_none());
}
