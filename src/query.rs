pub mod query_layer;
