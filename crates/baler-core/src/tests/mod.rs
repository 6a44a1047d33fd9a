mod master_index;
mod repair;
