mod end_to_end;
mod rpc_node;
mod runner;
